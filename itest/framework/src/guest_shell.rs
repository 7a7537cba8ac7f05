// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Running commands inside a guest over its network interface.

use std::{
    net::Ipv4Addr,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    time::Duration,
};

use anyhow::Context;
use tracing::{debug, info, warn};

/// The output of a command run in the guest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Something that can run commands in a guest and push files into it.
pub trait GuestShell {
    /// Runs `cmd` in the guest's shell and waits for it to exit. A non-zero
    /// exit status is reported in the output, not as an error.
    fn run(&self, cmd: &str) -> anyhow::Result<CommandOutput>;

    /// Copies the host file at `local` to `remote` in the guest.
    fn copy_to_guest(&self, local: &Path, remote: &str) -> anyhow::Result<()>;
}

/// A guest shell reached through the host's `ssh` and `scp` clients.
#[derive(Clone, Debug)]
pub struct SshConnection {
    addr: Ipv4Addr,
    user: String,
    key: PathBuf,
}

impl SshConnection {
    pub fn new(addr: Ipv4Addr, user: impl Into<String>, key: impl Into<PathBuf>) -> Self {
        Self { addr, user: user.into(), key: key.into() }
    }

    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    fn common_options(&self) -> Vec<String> {
        vec![
            "-i".to_string(),
            self.key.display().to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "ConnectTimeout=1".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
        ]
    }

    fn target(&self) -> String {
        format!("{}@{}", self.user, self.addr)
    }

    /// Retries a trivial command until the guest's ssh daemon answers or
    /// `timeout` elapses.
    pub fn wait_until_ready(&self, timeout: Duration) -> anyhow::Result<()> {
        info!(addr = %self.addr, ?timeout, "waiting for guest ssh");
        let try_login = || match self.run("true") {
            Ok(output) if output.success() => Ok(()),
            Ok(output) => Err(backoff::Error::transient(anyhow::anyhow!(
                "`true` exited with {}: {}",
                output.exit_code,
                output.stderr.trim()
            ))),
            Err(e) => Err(backoff::Error::permanent(e)),
        };

        let notify = |e: anyhow::Error, wait: Duration| {
            debug!(%e, ?wait, "guest ssh not ready yet");
        };

        backoff::retry_notify(
            backoff::ExponentialBackoff {
                max_elapsed_time: Some(timeout),
                max_interval: Duration::from_secs(2),
                ..Default::default()
            },
            try_login,
            notify,
        )
        .map_err(|e| match e {
            backoff::Error::Permanent(e) => e,
            backoff::Error::Transient { err, .. } => {
                warn!(addr = %self.addr, "guest ssh never became ready");
                err.context(format!("guest ssh at {} not ready", self.addr))
            }
        })
    }
}

impl GuestShell for SshConnection {
    fn run(&self, cmd: &str) -> anyhow::Result<CommandOutput> {
        debug!(addr = %self.addr, cmd, "running guest command");
        let output = Command::new("ssh")
            .args(self.common_options())
            .arg(self.target())
            .arg(cmd)
            .stdin(Stdio::null())
            .output()
            .context("spawning ssh")?;

        let result = CommandOutput {
            // No code means the client was killed by a signal.
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        debug!(exit_code = result.exit_code, "guest command finished");
        Ok(result)
    }

    fn copy_to_guest(&self, local: &Path, remote: &str) -> anyhow::Result<()> {
        info!(local = %local.display(), remote, "copying file to guest");
        let output = Command::new("scp")
            .args(self.common_options())
            .arg(local)
            .arg(format!("{}:{}", self.target(), remote))
            .stdin(Stdio::null())
            .output()
            .context("spawning scp")?;

        anyhow::ensure!(
            output.status.success(),
            "scp of {} to {} failed: {}",
            local.display(),
            remote,
            String::from_utf8_lossy(&output.stderr).trim()
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_is_a_zero_exit() {
        let mut output = CommandOutput {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        };
        assert!(output.success());
        output.exit_code = 255;
        assert!(!output.success());
    }

    #[test]
    fn ssh_options_disable_prompts() {
        let conn = SshConnection::new(
            Ipv4Addr::new(192, 168, 0, 2),
            "root",
            "/keys/id_rsa",
        );
        let opts = conn.common_options();
        assert_eq!(&opts[..2], ["-i", "/keys/id_rsa"]);
        assert!(opts.contains(&"BatchMode=yes".to_string()));
        assert!(opts.contains(&"StrictHostKeyChecking=no".to_string()));
        assert_eq!(conn.target(), "root@192.168.0.2");
    }
}
