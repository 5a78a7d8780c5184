//! External tool invocation: nm, readelf, c++filt.
//!
//! Every spawn is registered with the [`Supervisor`] for the duration of the
//! wait, and a non-zero exit becomes [`Error::Tool`] carrying the tool's
//! stderr so the caller can pass the diagnostic through.

use crate::error::{Error, Result};
use crate::supervisor::Supervisor;
use std::ffi::OsStr;
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::Arc;

/// Builds and runs `<prefix>nm` / `<prefix>readelf` / `<prefix>c++filt`.
#[derive(Debug, Clone)]
pub struct ToolRunner {
    prefix: String,
    supervisor: Arc<Supervisor>,
}

impl ToolRunner {
    pub fn new(prefix: &str, supervisor: Arc<Supervisor>) -> Self {
        Self {
            prefix: prefix.to_string(),
            supervisor,
        }
    }

    fn command(&self, tool: &str) -> Command {
        Command::new(format!("{}{}", self.prefix, tool))
    }

    /// Run a tool to completion and return its stdout.
    pub fn run<I, S>(&self, tool: &str, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<_> = args.into_iter().collect();
        let context = args
            .iter()
            .map(|a| a.as_ref().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        tracing::debug!(tool, %context, "running external tool");

        let child = self
            .command(tool)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::tool(tool, &context, e.to_string()))?;
        let _guard = self.supervisor.register(child.id());

        let output = child.wait_with_output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            return Err(Error::tool(tool, context, stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Batch-demangle symbol names via c++filt: one name per stdin line,
    /// one demangled name per stdout line.
    ///
    /// A missing demangler binary degrades to the identity mapping so the
    /// analyzer stays usable on hosts without binutils; a demangler that runs
    /// and fails is still an error.
    pub fn demangle(&self, names: &[String]) -> Result<Vec<String>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }

        let mut child = match self
            .command("c++filt")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    prefix = %self.prefix,
                    "c++filt not found, leaving symbol names mangled"
                );
                return Ok(names.to_vec());
            }
            Err(e) => return Err(Error::tool("c++filt", "<batch>", e.to_string())),
        };
        let _guard = self.supervisor.register(child.id());

        // Feed stdin from a separate thread; large batches would otherwise
        // deadlock against a full stdout pipe.
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::tool("c++filt", "<batch>", "no stdin handle"))?;
        let input: Vec<String> = names.to_vec();
        let writer = std::thread::spawn(move || -> std::io::Result<()> {
            for name in &input {
                writeln!(stdin, "{name}")?;
            }
            Ok(())
        });

        let output = child.wait_with_output()?;
        let _ = writer.join();

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            return Err(Error::tool("c++filt", "<batch>", stderr));
        }

        let demangled: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_owned)
            .collect();
        if demangled.len() != names.len() {
            return Err(Error::tool(
                "c++filt",
                "<batch>",
                format!(
                    "expected {} output lines, got {}",
                    names.len(),
                    demangled.len()
                ),
            ));
        }
        Ok(demangled)
    }
}
