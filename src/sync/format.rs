//! Formatting of generated and merged text before it is compared or written.

use std::io::Write;
use std::process::{Command, Stdio};

use anyhow::{Context, bail};
use camino::Utf8Path;
use glob::Pattern;

/// Normalizes file contents, e.g. by running a code formatter.
///
/// Must be deterministic and idempotent: formatting formatted text is a
/// no-op.
pub trait Formatter: Send + Sync {
    fn supports(&self, path: &Utf8Path) -> bool;

    fn format(&self, text: &str, path: &Utf8Path) -> anyhow::Result<String>;
}

/// Leaves every file as it is.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopFormatter;

impl Formatter for NoopFormatter {
    fn supports(&self, _: &Utf8Path) -> bool {
        false
    }

    fn format(&self, text: &str, _: &Utf8Path) -> anyhow::Result<String> {
        Ok(text.to_string())
    }
}

/// Pipes text through an external program.
///
/// The program reads the file on stdin and prints the formatted text on
/// stdout. `{path}` in an argument is replaced with the file's path, so
/// tools can pick a parser by extension.
#[derive(Debug, Clone)]
pub struct CommandFormatter {
    program: String,
    args: Vec<String>,
    patterns: Vec<Pattern>,
}

impl CommandFormatter {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            patterns: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Formats only paths matching `pattern`, e.g. `**/*.ts`.
    pub fn pattern(mut self, pattern: &str) -> Result<Self, glob::PatternError> {
        self.patterns.push(Pattern::new(pattern)?);
        Ok(self)
    }
}

impl Formatter for CommandFormatter {
    fn supports(&self, path: &Utf8Path) -> bool {
        self.patterns.iter().any(|p| p.matches(path.as_str()))
    }

    fn format(&self, text: &str, path: &Utf8Path) -> anyhow::Result<String> {
        let args = self.args.iter().map(|arg| arg.replace("{path}", path.as_str()));

        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Couldn't start formatter '{}'", self.program))?;

        let mut stdin = child.stdin.take().context("Formatter stdin unavailable")?;

        // The formatter may fill stdout before it has read all of stdin.
        let output = std::thread::scope(|s| {
            let writer = s.spawn(move || stdin.write_all(text.as_bytes()));
            let output = child.wait_with_output();
            let written = writer
                .join()
                .unwrap_or_else(|_| Err(std::io::Error::other("stdin writer panicked")));
            output.and_then(|output| written.map(|_| output))
        })
        .with_context(|| format!("Formatter '{}' failed on '{path}'", self.program))?;

        if !output.status.success() {
            bail!(
                "Formatter '{}' exited with {} on '{path}':\n{}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
        }

        String::from_utf8(output.stdout)
            .with_context(|| format!("Formatter '{}' printed invalid UTF-8", self.program))
    }
}
