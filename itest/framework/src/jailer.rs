// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Launching the VMM inside its jail and managing the jail's filesystem.
//!
//! The jailer chroots the VMM into `<chroot base>/<exec file name>/<id>/root`
//! and drops privileges to the configured uid and gid before exec'ing it.
//! Anything the VMM needs to open (kernel, disks, sockets) must therefore be
//! placed inside that directory and be accessible to the jail's user.

use std::{
    fmt,
    io::ErrorKind,
    process::{Child, ChildStdin, ChildStdout, Command, Stdio},
};

use anyhow::{bail, Context, Result};
use camino::Utf8PathBuf;
use tracing::{debug, error, info, warn};

/// A resource limit the jailer applies to the VMM before exec'ing it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceLimit {
    /// Maximum size, in bytes, of any file the VMM creates.
    FileSize(u64),

    /// Maximum number of open file descriptors.
    NoFile(u64),
}

impl fmt::Display for ResourceLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceLimit::FileSize(v) => write!(f, "fsize={v}"),
            ResourceLimit::NoFile(v) => write!(f, "no-file={v}"),
        }
    }
}

/// Everything needed to launch one VMM process under the jailer.
#[derive(Clone, Debug)]
pub struct JailerContext {
    /// Unique jail ID; also the name of the jail's directory.
    pub id: String,

    /// The VMM binary the jailer execs.
    pub exec_file: Utf8PathBuf,

    pub jailer_binary: Utf8PathBuf,
    pub uid: u32,
    pub gid: u32,
    pub chroot_base: Utf8PathBuf,

    /// A network namespace to join, as a path under `/var/run/netns`.
    pub netns: Option<Utf8PathBuf>,

    /// Passes `--daemonize`. [`JailedProcess::spawn`] refuses contexts with
    /// this set, since the jailer would exit after forking and leave the VMM
    /// outside the process handle.
    pub daemonize: bool,
    pub new_pid_ns: bool,
    pub resource_limits: Vec<ResourceLimit>,

    /// Extra arguments passed through to the VMM.
    pub extra_args: Vec<String>,
}

impl JailerContext {
    /// Returns the jailer's command line. `api_socket` is the VMM's API socket
    /// path as seen from inside the jail.
    pub fn construct_args(&self, api_socket: &str) -> Vec<String> {
        let mut args = vec![
            "--id".to_string(),
            self.id.clone(),
            "--exec-file".to_string(),
            self.exec_file.to_string(),
            "--uid".to_string(),
            self.uid.to_string(),
            "--gid".to_string(),
            self.gid.to_string(),
            "--chroot-base-dir".to_string(),
            self.chroot_base.to_string(),
        ];

        if let Some(netns) = &self.netns {
            args.extend(["--netns".to_string(), netns.to_string()]);
        }

        if self.daemonize {
            args.push("--daemonize".to_string());
        }

        if self.new_pid_ns {
            args.push("--new-pid-ns".to_string());
        }

        for limit in &self.resource_limits {
            args.extend(["--resource-limit".to_string(), limit.to_string()]);
        }

        args.extend([
            "--".to_string(),
            "--api-sock".to_string(),
            api_socket.to_string(),
        ]);
        args.extend(self.extra_args.iter().cloned());
        args
    }

    fn exec_file_name(&self) -> &str {
        self.exec_file.file_name().unwrap_or(self.exec_file.as_str())
    }

    /// The directory holding everything the jailer creates for this ID.
    fn jail_dir(&self) -> Utf8PathBuf {
        self.chroot_base.join(self.exec_file_name()).join(&self.id)
    }

    /// The directory the VMM is chrooted into.
    pub fn chroot_path(&self) -> Utf8PathBuf {
        self.jail_dir().join("root")
    }

    /// Maps a path inside the jail to the corresponding host path.
    pub fn jailed_path(&self, in_jail: &str) -> Utf8PathBuf {
        self.chroot_path().join(in_jail.trim_start_matches('/'))
    }

    /// Creates the chroot directory ahead of time so resources can be placed
    /// in it before the jailer starts.
    pub fn setup(&self) -> Result<()> {
        let root = self.chroot_path();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("creating jail root {root}"))
    }

    /// Makes the file at `path` visible inside the jail under its file name
    /// and hands it to the jail's user. Returns the in-jail path.
    ///
    /// The file is hard-linked into the chroot so that sockets and FIFOs keep
    /// their identity. Regular files on another filesystem are copied.
    pub fn create_jailed_resource(
        &self,
        path: impl AsRef<std::path::Path>,
    ) -> Result<String> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| {
                format!("resource {} has no usable file name", path.display())
            })?;

        let dest = self.chroot_path().join(name);
        if !dest.exists() {
            match std::fs::hard_link(path, &dest) {
                Ok(()) => {}
                Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
                    debug!(src = %path.display(), %dest, "copying resource across filesystems");
                    std::fs::copy(path, &dest).with_context(|| {
                        format!("copying {} to {dest}", path.display())
                    })?;
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("linking {} into jail at {dest}", path.display())
                    })
                }
            }
        }

        std::os::unix::fs::chown(&dest, Some(self.uid), Some(self.gid))
            .with_context(|| format!("chowning jailed resource {dest}"))?;

        debug!(src = %path.display(), %dest, "created jailed resource");
        Ok(format!("/{name}"))
    }

    /// Removes the jail's directory tree.
    pub fn cleanup(&self) -> Result<()> {
        let dir = self.jail_dir();
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing jail {dir}")),
        }
    }
}

/// How the jailed process's standard streams are connected.
pub struct ProcessStdio {
    /// Pipe stdin and stdout so they can back a serial console. Stderr
    /// always follows `stderr` below.
    pub capture_serial: bool,
    pub stdout: Stdio,
    pub stderr: Stdio,
}

/// A running jailer (and, once it execs, VMM) process. Dropping it kills the
/// process and waits for it to exit.
#[derive(Debug)]
pub struct JailedProcess {
    child: Child,
    id: String,
}

impl JailedProcess {
    pub fn spawn(
        ctx: &JailerContext,
        api_socket: &str,
        stdio: ProcessStdio,
    ) -> Result<Self> {
        if ctx.daemonize {
            bail!(
                "jail {} asks for --daemonize, which cannot be supervised",
                ctx.id
            );
        }

        let args = ctx.construct_args(api_socket);
        info!(jailer = %ctx.jailer_binary, id = %ctx.id, ?args, "launching jailer");

        let mut cmd = Command::new(&ctx.jailer_binary);
        cmd.args(&args).stderr(stdio.stderr);
        if stdio.capture_serial {
            cmd.stdin(Stdio::piped()).stdout(Stdio::piped());
        } else {
            cmd.stdin(Stdio::null()).stdout(stdio.stdout);
        }

        let child = cmd
            .spawn()
            .with_context(|| format!("spawning jailer {}", ctx.jailer_binary))?;

        info!(pid = child.id(), id = %ctx.id, "launched jailer");
        Ok(Self { child, id: ctx.id.clone() })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Takes the pipes backing the serial console, if they were captured and
    /// have not been taken already. Neither pipe is taken unless both are
    /// present.
    pub fn take_serial_pipes(&mut self) -> Option<(ChildStdout, ChildStdin)> {
        if self.child.stdout.is_none() || self.child.stdin.is_none() {
            return None;
        }

        self.child.stdout.take().zip(self.child.stdin.take())
    }

    /// Returns true if the process has exited.
    pub fn has_exited(&mut self) -> Result<bool> {
        Ok(self.child.try_wait()?.is_some())
    }
}

impl Drop for JailedProcess {
    fn drop(&mut self) {
        let pid = self.child.id();
        info!(pid, id = %self.id, "killing jailed process that was dropped");

        match self.child.try_wait() {
            Ok(Some(status)) => {
                warn!(pid, %status, "jailed process had already exited");
                return;
            }
            Ok(None) => {}
            Err(e) => warn!(pid, %e, "failed to query jailed process"),
        }

        // SAFETY: `pid` names our own unreaped child, so it cannot have been
        // recycled for another process.
        let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
        if ret != 0 {
            error!(pid, e = %std::io::Error::last_os_error(), "failed to kill jailed process");
        }

        match self.child.wait() {
            Ok(status) => info!(pid, %status, "jailed process exited"),
            Err(e) => error!(pid, %e, "failed to wait for jailed process"),
        }
    }
}
