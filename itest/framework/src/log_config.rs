// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Where the output of VMM processes (and their serial consoles) goes.

use std::{fs::File, path::Path, process::Stdio, str::FromStr};

use anyhow::Context;
use tracing::info;

/// How a test's VMM output should be managed.
#[derive(Debug, Clone, Copy)]
pub struct LogConfig {
    pub output_mode: OutputMode,
    pub log_format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { output_mode: OutputMode::TmpFile, log_format: LogFormat::Plain }
    }
}

/// Where stdout/stderr of a test's processes are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Files in the VM's data directory.
    TmpFile,

    /// The runner's own stdout/stderr.
    Stdio,

    /// /dev/null.
    Null,
}

impl FromStr for OutputMode {
    type Err = std::io::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mode = match s.to_ascii_lowercase().as_str() {
            "file" | "tmpfile" => OutputMode::TmpFile,
            "stdio" => OutputMode::Stdio,
            "null" => OutputMode::Null,
            other => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("unknown VMM output mode {other:?}"),
                ))
            }
        };
        Ok(mode)
    }
}

impl OutputMode {
    /// Opens the (stdout, stderr) pair for a VMM process. In file mode the
    /// logs are `<dir>/<prefix>.stdout.log` and `<dir>/<prefix>.stderr.log`.
    pub(crate) fn stdio_pair(
        &self,
        dir: &Path,
        prefix: &str,
    ) -> anyhow::Result<(Stdio, Stdio)> {
        let pair = match self {
            OutputMode::TmpFile => {
                let out = dir.join(format!("{prefix}.stdout.log"));
                let err = dir.join(format!("{prefix}.stderr.log"));
                info!(stdout = %out.display(), stderr = %err.display(), "opening VMM log files");
                (open_log(&out)?.into(), open_log(&err)?.into())
            }
            OutputMode::Stdio => (Stdio::inherit(), Stdio::inherit()),
            OutputMode::Null => (Stdio::null(), Stdio::null()),
        };
        Ok(pair)
    }

    /// Whether serial console output should also be mirrored to a file.
    pub(crate) fn keeps_files(&self) -> bool {
        matches!(self, OutputMode::TmpFile)
    }
}

/// How the runner's own log lines are structured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Plain, hopefully human-readable output.
    Plain,

    /// Bunyan JSON, for machine processing (such as in CI).
    Bunyan,
}

fn open_log(path: &Path) -> anyhow::Result<File> {
    File::create(path)
        .with_context(|| format!("creating log file {}", path.display()))
}
