//! External command description.

use std::fmt;

/// Program plus arguments for one external process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Build a tokio command. Stdio is left to the caller.
    pub(crate) fn to_command(&self) -> tokio::process::Command {
        let mut cmd = process_utils::tokio_command(&self.program);
        // Stable, parseable tool diagnostics regardless of host locale.
        cmd.args(&self.args).env("LC_ALL", "C");
        cmd
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_joins_program_and_args() {
        let spec = CommandSpec::new("ffmpeg", ["-i", "pipe:0"]).arg("pipe:1");
        assert_eq!(spec.to_string(), "ffmpeg -i pipe:0 pipe:1");
    }
}
