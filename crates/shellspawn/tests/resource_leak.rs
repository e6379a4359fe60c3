mod common;

#[cfg(target_os = "linux")]
mod resource_leak {
    use super::common::{init_tracing, testclient_command};
    use shellspawn::{Captured, InputReply, Spawn};

    fn count_entries(dir: &str) -> usize {
        std::fs::read_dir(dir).expect("read proc dir").count()
    }

    // Single test in this binary so no other test opens descriptors meanwhile.
    #[test]
    fn test_repeated_spawns_release_descriptors_and_threads() {
        init_tracing();
        let warm = |round: usize| {
            let output = Spawn::<usize>::new(testclient_command(""))
                .stdin_callback(move |_| InputReply::Line(format!("Round {round}\n")))
                .stdout_callback(|seen, _| *seen += 1)
                .stderr_lines()
                .run(&mut 0)
                .expect("spawn");
            assert_eq!(output.exit_code, 123);
            let plain = Spawn::<()>::new("cat")
                .stdin_lines(["x"])
                .stdout_lines()
                .run(&mut ())
                .expect("spawn");
            assert_eq!(plain.stdout, Captured::Lines(vec!["x".to_string()]));
        };

        warm(0);
        let fds_before = count_entries("/proc/self/fd");
        let threads_before = count_entries("/proc/self/task");

        for round in 1..=100 {
            warm(round);
        }

        assert_eq!(count_entries("/proc/self/fd"), fds_before);
        assert_eq!(count_entries("/proc/self/task"), threads_before);
    }
}
