//! Command string splitting and executable lookup.
//!
//! A command string is a program token followed by arguments separated by
//! spaces. A token that starts with a single or double quote runs to the
//! matching quote (or the end of the string) and the quotes are stripped.
//! There is no escape character, so a quote cannot appear inside a quoted
//! token. An unquoted token runs to the next space and keeps any quote
//! characters it contains.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// A command string split into a program token and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    /// The program token as written (a bare name or a path).
    pub program: String,
    /// Arguments after the program token.
    pub args: Vec<String>,
}

impl ParsedCommand {
    /// The name the child sees as `argv[0]`: the program token without
    /// any leading directories.
    pub fn arg0(&self) -> &str {
        match self.program.rfind('/') {
            Some(idx) => &self.program[idx + 1..],
            None => &self.program,
        }
    }
}

/// Splits a command string. Returns `None` when no program token is present.
pub fn parse_command(command: &str) -> Option<ParsedCommand> {
    let mut tokens = tokenize(command).into_iter();
    let program = tokens.next().filter(|p| !p.is_empty())?;
    Some(ParsedCommand {
        program,
        args: tokens.collect(),
    })
}

fn tokenize(command: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = command.chars().peekable();
    loop {
        while chars.next_if_eq(&' ').is_some() {}
        let Some(first) = chars.next() else {
            break;
        };
        let mut token = String::new();
        if first == '"' || first == '\'' {
            for c in chars.by_ref() {
                if c == first {
                    break;
                }
                token.push(c);
            }
        } else {
            token.push(first);
            while let Some(c) = chars.next_if(|c| *c != ' ') {
                token.push(c);
            }
        }
        tokens.push(token);
    }
    tokens
}

/// Locates the executable for a program token.
///
/// The token is first checked as given. A token containing `/` is a path and
/// is never searched for; otherwise each entry of `search_path` (or of the
/// `PATH` environment variable when `None`) is tried in order. Empty entries
/// are skipped.
pub fn resolve_executable(program: &str, search_path: Option<&str>) -> Option<PathBuf> {
    let direct = Path::new(program);
    if is_executable(direct) {
        return Some(direct.to_path_buf());
    }
    if program.contains('/') {
        return None;
    }

    let paths = match search_path {
        Some(path) => OsString::from(path),
        None => std::env::var_os("PATH")?,
    };
    std::env::split_paths(&paths)
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

/// Check if `path` is a regular file this process may execute.
///
/// The owner bit counts when the file belongs to the effective user, the
/// group bit when it belongs to the effective group, the other bit always.
#[cfg(unix)]
pub fn is_executable(path: &Path) -> bool {
    use nix::unistd::{getegid, geteuid};
    use std::os::unix::fs::MetadataExt;

    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    let mode = meta.mode();
    (mode & 0o100 != 0 && meta.uid() == geteuid().as_raw())
        || (mode & 0o010 != 0 && meta.gid() == getegid().as_raw())
        || mode & 0o001 != 0
}

/// Check if `path` is a regular file. Execute permission is left to the loader.
#[cfg(not(unix))]
pub fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path).is_ok_and(|meta| meta.is_file())
}
