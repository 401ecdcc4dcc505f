//! A bash-like mini-shell for cross-platform command chaining.
//!
//! Supports the operators `&&`, `||`, and `;` with bash-like skip
//! semantics, but runs each command natively — no shell is involved.

use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    /// Run the next command only if the previous one succeeded.
    And,
    /// Run the next command only if the previous one failed.
    Or,
    /// Always run the next command.
    Seq,
}

impl Operator {
    fn from_token(token: &str) -> Option<Self> {
        match token {
            "&&" => Some(Operator::And),
            "||" => Some(Operator::Or),
            ";" => Some(Operator::Seq),
            _ => None,
        }
    }

    /// Whether the command after this operator is skipped given the last
    /// executed command's exit code.
    fn skips(self, last_exit: i32) -> bool {
        match self {
            Operator::And => last_exit != 0,
            Operator::Or => last_exit == 0,
            Operator::Seq => false,
        }
    }
}

/// Execute a pipeline command string and return the exit code of the last
/// executed command (0 if nothing ran).
///
/// Skipped commands do not update the last exit code, so a failure
/// short-circuits every following `&&` segment until an `||` or `;`.
pub fn run(command_string: &str) -> Result<i32> {
    run_in(command_string, None)
}

/// Like [`run`], but each command executes with `dir` as its working
/// directory.
pub fn run_in(command_string: &str, dir: Option<&Path>) -> Result<i32> {
    let (commands, operators) = parse(command_string)?;

    let mut last_exit = 0;
    for (idx, cmd) in commands.iter().enumerate() {
        if idx > 0 && operators[idx - 1].skips(last_exit) {
            continue;
        }

        info!("running: {}", shell_words::join(cmd));
        let mut process = Command::new(&cmd[0]);
        process.args(&cmd[1..]);
        if let Some(dir) = dir {
            process.current_dir(dir);
        }
        let status = process
            .status()
            .with_context(|| format!("failed to launch '{}'", cmd[0]))?;
        last_exit = status.code().unwrap_or(-1);
        if last_exit != 0 {
            warn!(
                "command failed with exit code {last_exit}: {}",
                shell_words::join(cmd)
            );
        }
    }
    Ok(last_exit)
}

/// Split a command string into commands and the operators between them.
fn parse(command_string: &str) -> Result<(Vec<Vec<String>>, Vec<Operator>)> {
    let tokens =
        shell_words::split(command_string).context("failed to tokenize command string")?;

    let mut commands: Vec<Vec<String>> = Vec::new();
    let mut operators: Vec<Operator> = Vec::new();
    let mut current: Vec<String> = Vec::new();

    for token in tokens {
        if let Some(op) = Operator::from_token(&token) {
            if current.is_empty() {
                bail!("empty command before '{token}'");
            }
            commands.push(std::mem::take(&mut current));
            operators.push(op);
        } else {
            current.push(token);
        }
    }
    if !current.is_empty() {
        commands.push(current);
    } else if !operators.is_empty() {
        bail!("trailing operator with no command");
    }
    Ok((commands, operators))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_splits_on_operators() {
        let (commands, operators) = parse("a one && b || c ; d").unwrap();
        assert_eq!(
            commands,
            vec![
                vec!["a".to_string(), "one".to_string()],
                vec!["b".to_string()],
                vec!["c".to_string()],
                vec!["d".to_string()],
            ]
        );
        assert_eq!(operators, vec![Operator::And, Operator::Or, Operator::Seq]);
    }

    #[test]
    fn parse_respects_quoting() {
        let (commands, _) = parse(r#"echo "a && b""#).unwrap();
        assert_eq!(commands, vec![vec!["echo".to_string(), "a && b".to_string()]]);
    }

    #[test]
    fn parse_rejects_dangling_operators() {
        assert!(parse("&& a").is_err());
        assert!(parse("a &&").is_err());
        assert!(parse("a && && b").is_err());
    }

    #[test]
    fn and_runs_only_after_success() {
        assert_eq!(run("true && true").unwrap(), 0);
        // `false && true`: the second command is skipped, exit stays 1.
        assert_eq!(run("false && true").unwrap(), 1);
    }

    #[test]
    fn or_runs_only_after_failure() {
        assert_eq!(run("false || true").unwrap(), 0);
        assert_eq!(run("true || false").unwrap(), 0);
    }

    #[test]
    fn seq_always_runs() {
        assert_eq!(run("false ; true").unwrap(), 0);
        assert_eq!(run("true ; false").unwrap(), 1);
    }

    #[test]
    fn skipped_commands_leave_exit_code_visible_downstream() {
        // After `false`, the `&&` segment is skipped with the failure still
        // recorded, so the final `||` segment runs.
        assert_eq!(run("false && true || true").unwrap(), 0);
    }

    #[test]
    fn empty_string_is_a_no_op() {
        assert_eq!(run("").unwrap(), 0);
    }

    #[test]
    fn unlaunchable_command_is_an_error() {
        assert!(run("definitely-not-a-real-binary-xyz").is_err());
    }

    #[test]
    fn run_in_sets_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker"), b"x").unwrap();
        assert_eq!(run_in("test -f marker", Some(dir.path())).unwrap(), 0);
        assert_eq!(run_in("test -f absent", Some(dir.path())).unwrap(), 1);
    }
}
