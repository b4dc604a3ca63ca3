use std::process::Command;

use anyhow::{anyhow, Context, Result};
use tracing::debug;

use crate::commands::shell_quote;

/// Captured result of one privileged execution unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub output_lines: Vec<String>,
}

impl CommandOutput {
    pub fn ok(lines: &[&str]) -> Self {
        Self {
            success: true,
            output_lines: lines.iter().map(|line| line.to_string()).collect(),
        }
    }

    pub fn failed(lines: &[&str]) -> Self {
        Self {
            success: false,
            output_lines: lines.iter().map(|line| line.to_string()).collect(),
        }
    }

    pub fn joined(&self) -> String {
        self.output_lines.join("\n")
    }
}

/// Executes command lines with elevated privilege as one unit.
///
/// Lines run in order and stop at the first failure. Nothing is rolled back
/// when a later line fails.
pub trait CommandRunner {
    fn execute(&self, command_lines: &[String]) -> Result<CommandOutput>;
}

impl<F> CommandRunner for F
where
    F: Fn(&[String]) -> Result<CommandOutput>,
{
    fn execute(&self, command_lines: &[String]) -> Result<CommandOutput> {
        self(command_lines)
    }
}

/// Runs command lines through a shell invoked as `<program> <args..> <script>`,
/// e.g. `su -c` on a rooted device or `sh -c` inside a privileged session.
///
/// A remote prefix such as `adb shell su -c` joins its arguments into one
/// line that the device shell parses again, so the script is quoted as a
/// single word before it is appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellRunner {
    program: String,
    args: Vec<String>,
    remote: bool,
}

impl ShellRunner {
    pub fn new(argv_prefix: &[String]) -> Result<Self> {
        let Some((program, args)) = argv_prefix.split_first() else {
            return Err(anyhow!("shell command prefix must not be empty"));
        };
        if program.trim().is_empty() {
            return Err(anyhow!("shell program must not be empty"));
        }
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            remote: is_remote_prefix(program, args),
        })
    }

    /// Overrides whether the prefix re-parses the script on the far side.
    pub fn with_remote(mut self, remote: bool) -> Self {
        self.remote = remote;
        self
    }

    pub fn is_remote(&self) -> bool {
        self.remote
    }

    pub fn su() -> Self {
        Self {
            program: "su".to_string(),
            args: vec!["-c".to_string()],
            remote: false,
        }
    }

    pub fn sh() -> Self {
        Self {
            program: "sh".to_string(),
            args: vec!["-c".to_string()],
            remote: false,
        }
    }
}

impl CommandRunner for ShellRunner {
    fn execute(&self, command_lines: &[String]) -> Result<CommandOutput> {
        let script = command_lines.join(" && ");
        debug!(
            program = %self.program,
            %script,
            remote = self.remote,
            "running privileged command"
        );

        let script = if self.remote {
            shell_quote(&script)
        } else {
            script
        };
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(&script)
            .output()
            .with_context(|| format!("failed to start shell '{}'", self.program))?;

        let mut output_lines = Vec::new();
        for stream in [&output.stdout, &output.stderr] {
            output_lines.extend(
                String::from_utf8_lossy(stream)
                    .lines()
                    .map(str::trim_end)
                    .filter(|line| !line.is_empty())
                    .map(str::to_string),
            );
        }

        debug!(
            status = %output.status,
            lines = output_lines.len(),
            "privileged command finished"
        );
        Ok(CommandOutput {
            success: output.status.success(),
            output_lines,
        })
    }
}

/// `adb [-s <serial>] shell ...` hands its arguments to the device shell as
/// one joined line.
fn is_remote_prefix(program: &str, args: &[String]) -> bool {
    let is_adb = std::path::Path::new(program)
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name == "adb" || name == "adb.exe");
    is_adb && args.iter().any(|arg| arg == "shell")
}
