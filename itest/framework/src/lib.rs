// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The itest framework: interfaces for creating jailed VMs, driving their
//! guests, and checking their devices.
//!
//! Test cases receive a [`Framework`], use it to spawn [`Microvm`]s, and use
//! the modules below to talk to them:
//!
//! - [`vsock`] verifies a VM's vsock device end to end.
//! - [`serial`] scripts interactions with a guest's serial console.
//! - [`guest_shell`] runs commands in a guest over ssh.

use std::{
    ops::Range,
    sync::atomic::{AtomicU8, Ordering},
};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use tracing::info;

pub mod cid_allocator;
pub mod fingerprint;
pub mod guest_shell;
pub mod jailer;
pub mod log_config;
pub mod microvm;
pub mod serial;
pub mod transport;
pub mod vsock;

pub use microvm::{Microvm, VmConfig};

use cid_allocator::{CidAllocatorError, GuestCidAllocator};
use jailer::JailerContext;
use log_config::LogConfig;
use microvm::{MicrovmParams, NetworkConfig};

/// Parameters used to construct a [`Framework`].
#[derive(Clone, Debug)]
pub struct FrameworkParameters {
    /// The VMM binary the jailer execs.
    pub firecracker: Utf8PathBuf,
    pub jailer: Utf8PathBuf,

    /// Guest kernel and root filesystem used by the default VM config.
    pub kernel: Utf8PathBuf,
    pub rootfs: Utf8PathBuf,

    /// Private key accepted by the guest's root account.
    pub ssh_key: Utf8PathBuf,

    /// Guest-side vsock helper binary. Tests that need it skip themselves
    /// when it is absent.
    pub vsock_helper: Option<Utf8PathBuf>,

    /// Directory for VM logs and scratch files.
    pub tmp_directory: Utf8PathBuf,

    /// Directory under which the jailer builds its chroots.
    pub chroot_base: Utf8PathBuf,

    pub jail_uid: u32,
    pub jail_gid: u32,

    pub log_config: LogConfig,

    pub default_guest_cpus: u8,
    pub default_guest_memory_mib: u32,

    pub guest_cid_range: Range<u32>,
}

/// Shared state for one test run: the runtime VM API calls run on, the
/// defaults VMs are built from, and allocators for per-VM resources.
pub struct Framework {
    params: FrameworkParameters,
    pub(crate) tokio_rt: tokio::runtime::Runtime,
    cid_allocator: GuestCidAllocator,

    /// Index of the next tap link. See [`NetworkConfig::for_index`].
    next_network: AtomicU8,
}

impl Framework {
    pub fn new(params: FrameworkParameters) -> Result<Self> {
        info!(?params, "building test framework");
        std::fs::create_dir_all(&params.tmp_directory).with_context(|| {
            format!("creating tmp directory {}", params.tmp_directory)
        })?;

        let tokio_rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("itest-framework")
            .build()
            .context("building framework tokio runtime")?;

        let cid_allocator =
            GuestCidAllocator::new(params.guest_cid_range.clone());

        Ok(Self { params, tokio_rt, cid_allocator, next_network: AtomicU8::new(0) })
    }

    pub fn params(&self) -> &FrameworkParameters {
        &self.params
    }

    pub fn vsock_helper(&self) -> Option<&Utf8Path> {
        self.params.vsock_helper.as_deref()
    }

    /// Returns a config for a VM with the default CPU count, memory size,
    /// kernel, and root filesystem.
    pub fn default_vm_config(&self, vm_name: &str) -> VmConfig {
        VmConfig::new(
            vm_name,
            self.params.default_guest_cpus,
            self.params.default_guest_memory_mib,
            &self.params.kernel,
            &self.params.rootfs,
        )
    }

    /// Allocates a guest CID not yet used in this test.
    pub fn next_guest_cid(&self) -> Result<u32, CidAllocatorError> {
        self.cid_allocator.next()
    }

    /// Allocates a tap link not yet used in this test.
    pub fn next_network(&self) -> NetworkConfig {
        NetworkConfig::for_index(self.next_network.fetch_add(1, Ordering::Relaxed))
    }

    /// Launches the jailer for a new VM described by `config`. The VMM is
    /// running when this returns, but the guest has not been configured or
    /// booted.
    pub fn spawn_vm(&self, config: &VmConfig) -> Result<Microvm> {
        let jailer = JailerContext {
            id: uuid::Uuid::new_v4().to_string(),
            exec_file: self.params.firecracker.clone(),
            jailer_binary: self.params.jailer.clone(),
            uid: self.params.jail_uid,
            gid: self.params.jail_gid,
            chroot_base: self.params.chroot_base.clone(),
            netns: None,
            daemonize: false,
            new_pid_ns: false,
            resource_limits: Vec::new(),
            extra_args: Vec::new(),
        };

        self.spawn_vm_with_jailer(config, jailer)
    }

    /// Like [`Self::spawn_vm`], but with a caller-supplied jailer context.
    pub fn spawn_vm_with_jailer(
        &self,
        config: &VmConfig,
        jailer: JailerContext,
    ) -> Result<Microvm> {
        let data_dir = self.params.tmp_directory.join(config.vm_name());
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("creating VM data directory {data_dir}"))?;

        Microvm::new(
            config,
            MicrovmParams {
                rt: self.tokio_rt.handle().clone(),
                jailer,
                data_dir,
                log_config: self.params.log_config,
                ssh_key: self.params.ssh_key.clone(),
            },
        )
    }

    /// Returns per-test state to its initial values. Called by the runner
    /// between tests.
    pub fn reset(&self) {
        self.cid_allocator.reset();
        self.next_network.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log_config::{LogFormat, OutputMode};

    fn params(tmp: &Utf8Path) -> FrameworkParameters {
        FrameworkParameters {
            firecracker: "/usr/bin/firecracker".into(),
            jailer: "/usr/bin/jailer".into(),
            kernel: "/images/vmlinux".into(),
            rootfs: "/images/rootfs.ext4".into(),
            ssh_key: "/images/id_rsa".into(),
            vsock_helper: None,
            tmp_directory: tmp.join("itest"),
            chroot_base: tmp.join("jailer"),
            jail_uid: 1234,
            jail_gid: 1234,
            log_config: LogConfig {
                output_mode: OutputMode::Null,
                log_format: LogFormat::Plain,
            },
            default_guest_cpus: 2,
            default_guest_memory_mib: 256,
            guest_cid_range: 0..5,
        }
    }

    #[test]
    fn defaults_flow_into_vm_configs() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = Utf8Path::from_path(dir.path()).unwrap();
        let framework = Framework::new(params(tmp)).unwrap();
        assert!(tmp.join("itest").is_dir());

        let config = framework.default_vm_config("smoke");
        assert_eq!(config.vm_name(), "smoke");
        assert_eq!(config.vcpu_count(), 2);
        assert_eq!(config.memory_size_mib(), 256);
        assert_eq!(config.kernel_path(), Utf8Path::new("/images/vmlinux"));
        assert!(framework.vsock_helper().is_none());
    }

    #[test]
    fn reset_recycles_per_test_resources() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = Utf8Path::from_path(dir.path()).unwrap();
        let framework = Framework::new(params(tmp)).unwrap();

        assert_eq!(framework.next_guest_cid(), Ok(3));
        assert_eq!(framework.next_guest_cid(), Ok(4));
        assert!(framework.next_guest_cid().is_err());
        assert_eq!(framework.next_network().tap_name, "itest-tap0");
        assert_eq!(framework.next_network().tap_name, "itest-tap1");

        framework.reset();
        assert_eq!(framework.next_guest_cid(), Ok(3));
        assert_eq!(framework.next_network().tap_name, "itest-tap0");
    }

    #[test]
    fn failed_spawn_removes_the_jail() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = Utf8Path::from_path(dir.path()).unwrap();
        let mut params = params(tmp);
        params.jailer = tmp.join("no-such-jailer");
        let framework = Framework::new(params).unwrap();

        let config = framework.default_vm_config("doomed");
        let err = framework.spawn_vm(&config).err().unwrap();
        assert!(format!("{err:#}").contains("no-such-jailer"), "{err:#}");

        let jails = tmp.join("jailer").join("firecracker");
        let leftovers = std::fs::read_dir(&jails)
            .map(|entries| entries.count())
            .unwrap_or(0);
        assert_eq!(leftovers, 0, "jail directories left under {jails}");
    }
}
