//! Interactive client driven by the integration tests.
//!
//! Greets, echoes its arguments, writes to stderr, asks for a name until the
//! answer is something other than `repeat`, and exits with 123. End of input
//! counts as an empty name.

use std::io::{self, BufRead, Write};
use std::process::ExitCode;

const EXIT_CODE: u8 = 123;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::from(EXIT_CODE),
        Err(e) => {
            eprintln!("shellspawn-testclient: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> io::Result<()> {
    let mut out = io::stdout().lock();
    let mut err = io::stderr().lock();

    writeln!(out, "Test Client for shellspawn")?;
    for (i, arg) in std::env::args_os().enumerate() {
        writeln!(out, "Argument {i}:{}", arg.to_string_lossy())?;
    }
    out.flush()?;

    writeln!(err, "This is an error message")?;
    err.flush()?;

    let name = loop {
        writeln!(out, "What is your name?")?;
        out.flush()?;
        let answer = read_answer();
        if answer != "repeat" {
            break answer;
        }
        writeln!(out, "Please repeat that!")?;
        out.flush()?;
    };

    writeln!(out, "Your name is {name}")?;
    out.flush()?;

    writeln!(err, "This is another error message")?;
    err.flush()
}

/// One line without its terminator; empty on end of input or a read error.
fn read_answer() -> String {
    let mut line = String::new();
    match io::stdin().lock().read_line(&mut line) {
        Ok(_) => line.trim_end_matches(['\n', '\r']).to_string(),
        Err(_) => String::new(),
    }
}
