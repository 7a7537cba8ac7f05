// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Routines for starting jailed VMs, changing their states, and reaching their
//! guests.

use std::{
    process::{ChildStdin, ChildStdout},
    time::Duration,
};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::{error, info, info_span, instrument};
use uuid::Uuid;

use crate::{
    guest_shell::SshConnection,
    jailer::{JailedProcess, JailerContext, ProcessStdio},
    log_config::LogConfig,
    serial::SerialConsole,
};

pub mod api;
mod config;
pub mod network;

pub use api::{ApiClient, ApiError};
pub use config::{VmConfig, VsockConfig, DEFAULT_BOOT_ARGS};
pub use network::{NetworkConfig, Tap};

use api::{
    ActionType, BootSource, Drive, InstanceActionInfo, InstanceInfo,
    MachineConfig, NetworkInterface, VmState as ApiVmState, VmStateChange,
    Vsock,
};

/// The VMM's API socket, relative to the jail root.
pub const API_SOCKET: &str = "/api.socket";

/// A serial console attached to a VMM's stdio.
pub type VmSerialConsole = SerialConsole<ChildStdout, ChildStdin>;

#[derive(Debug, Error)]
pub enum VmStateError {
    #[error("operation can only be performed on a VM that has not been started")]
    AlreadyStarted,

    #[error("VM {0} has no network interface")]
    NoNetwork(String),

    #[error("VM {0} was not configured to capture its serial console")]
    NoSerialConsole(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum VmState {
    New,
    Configured,
    Started,
}

/// Everything [`Microvm::new`] needs from the framework.
pub(crate) struct MicrovmParams {
    pub rt: tokio::runtime::Handle,
    pub jailer: JailerContext,
    pub data_dir: Utf8PathBuf,
    pub log_config: LogConfig,
    pub ssh_key: Utf8PathBuf,
}

/// A VM running under the jailer. Tests create these through
/// [`crate::Framework::spawn_vm`].
///
/// A freshly spawned VM has a running VMM process but no guest yet; tests
/// usually call [`Microvm::launch`] (or [`Microvm::configure`] followed by
/// [`Microvm::start`]) before interacting with the guest.
pub struct Microvm {
    id: Uuid,
    rt: tokio::runtime::Handle,
    config: VmConfig,
    jailer: JailerContext,
    process: Option<JailedProcess>,
    api: ApiClient,
    data_dir: Utf8PathBuf,
    tap: Option<Tap>,
    serial: Option<VmSerialConsole>,
    ssh_key: Utf8PathBuf,
    tracing_span: tracing::Span,
    state: VmState,
}

impl Microvm {
    #[instrument(skip_all, fields(vm = config.vm_name()))]
    pub(crate) fn new(config: &VmConfig, params: MicrovmParams) -> Result<Self> {
        let MicrovmParams { rt, jailer, data_dir, log_config, ssh_key } =
            params;
        let id = Uuid::new_v4();
        let vm_name = config.vm_name();
        info!(%id, ?config, jail = %jailer.id, "spawning VM");

        jailer.setup()?;
        let (tap, process, serial) =
            match Self::launch_in_jail(config, &jailer, &data_dir, &log_config) {
                Ok(parts) => parts,
                Err(e) => {
                    if let Err(cleanup) = jailer.cleanup() {
                        error!("failed to clean up jail after a failed spawn: {cleanup:#}");
                    }
                    return Err(e);
                }
            };

        let api = ApiClient::new(jailer.jailed_path(API_SOCKET));
        let tracing_span = info_span!(parent: None, "VM", vm = %vm_name, %id);

        Ok(Self {
            id,
            rt,
            config: config.clone(),
            jailer,
            process: Some(process),
            api,
            data_dir,
            tap,
            serial,
            ssh_key,
            tracing_span,
            state: VmState::New,
        })
    }

    /// Everything between creating the jail and having a live VMM. Whatever
    /// this created is dropped again if it fails.
    fn launch_in_jail(
        config: &VmConfig,
        jailer: &JailerContext,
        data_dir: &Utf8Path,
        log_config: &LogConfig,
    ) -> Result<(Option<Tap>, JailedProcess, Option<VmSerialConsole>)> {
        let vm_name = config.vm_name();
        let tap = config.network_config().map(Tap::create).transpose()?;

        // NOTE: `log_format` only reaches the VMM's output as a log field.
        // The VMM writes plain text regardless, so a Bunyan-formatted run still
        // gets plain VMM logs.
        info!(format = ?log_config.log_format, mode = ?log_config.output_mode,
              "routing VMM output");
        let (stdout, stderr) =
            log_config.output_mode.stdio_pair(data_dir.as_std_path(), vm_name)?;
        let mut process = JailedProcess::spawn(
            jailer,
            API_SOCKET,
            ProcessStdio {
                capture_serial: config.serial_captured(),
                stdout,
                stderr,
            },
        )?;

        let serial = match process.take_serial_pipes() {
            Some((rx, tx)) => {
                let console = SerialConsole::new(rx, tx);
                if log_config.output_mode.keeps_files() {
                    Some(console.with_log_file(
                        &data_dir.join(format!("{vm_name}.serial.log")),
                    )?)
                } else {
                    Some(console)
                }
            }
            None => None,
        };

        Ok((tap, process, serial))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        self.config.vm_name()
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn jailer(&self) -> &JailerContext {
        &self.jailer
    }

    /// The directory holding this VM's logs and scratch files. It lives
    /// outside the jail.
    pub fn data_dir(&self) -> &Utf8Path {
        &self.data_dir
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(JailedProcess::pid)
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    /// Makes a host file visible inside this VM's jail. Returns the path the
    /// VMM should use for it.
    pub fn create_jailed_resource(
        &self,
        path: impl AsRef<std::path::Path>,
    ) -> Result<String> {
        self.jailer.create_jailed_resource(path)
    }

    /// The host path of the vsock device's Unix socket, if the VM has one.
    pub fn vsock_uds_path(&self) -> Option<Utf8PathBuf> {
        self.config.vsock_config().map(|v| self.jailer.jailed_path(&v.uds_path))
    }

    /// Sends the pre-boot configuration: machine shape, kernel, root disk, and
    /// any vsock or network devices.
    pub fn configure(&mut self) -> Result<()> {
        let _span = self.tracing_span.enter();
        if self.state != VmState::New {
            return Err(VmStateError::AlreadyStarted.into());
        }

        let kernel = self.create_jailed_resource(self.config.kernel_path())?;
        let rootfs = self.create_jailed_resource(self.config.rootfs_path())?;
        let machine = MachineConfig {
            vcpu_count: self.config.vcpu_count(),
            mem_size_mib: self.config.memory_size_mib(),
            smt: None,
        };
        let boot = BootSource {
            kernel_image_path: kernel,
            boot_args: Some(self.config.kernel_cmdline()),
        };
        let drive = Drive {
            drive_id: "rootfs".to_string(),
            path_on_host: rootfs,
            is_root_device: true,
            is_read_only: false,
        };
        let vsock = self.config.vsock_config().map(|v| Vsock {
            guest_cid: v.guest_cid,
            uds_path: v.uds_path.clone(),
        });
        let net = self.config.network_config().map(|n| NetworkInterface {
            iface_id: "eth0".to_string(),
            host_dev_name: n.tap_name.clone(),
            guest_mac: Some(n.guest_mac.clone()),
        });

        info!(?machine, ?boot, ?vsock, ?net, "configuring VM");
        self.rt.block_on(async {
            self.api.put("/machine-config", &machine).await?;
            self.api.put("/boot-source", &boot).await?;
            self.api.put("/drives/rootfs", &drive).await?;
            if let Some(vsock) = &vsock {
                self.api.put("/vsock", vsock).await?;
            }
            if let Some(net) = &net {
                self.api.put("/network-interfaces/eth0", net).await?;
            }
            Ok::<_, ApiError>(())
        })?;

        self.state = VmState::Configured;
        Ok(())
    }

    /// Boots the configured guest.
    pub fn start(&mut self) -> Result<()> {
        let _span = self.tracing_span.enter();
        if self.state == VmState::Started {
            return Err(VmStateError::AlreadyStarted.into());
        }

        info!("starting VM");
        self.rt.block_on(self.api.put(
            "/actions",
            &InstanceActionInfo { action_type: ActionType::InstanceStart },
        ))?;

        self.state = VmState::Started;
        Ok(())
    }

    /// Configures the VM if necessary, then boots it.
    pub fn launch(&mut self) -> Result<()> {
        if self.state == VmState::New {
            self.configure()?;
        }

        self.start()
    }

    /// Asks the VMM to pause the guest. Pausing a VM that has not been started
    /// is rejected by the VMM, and the rejection is returned as-is.
    pub fn pause(&self) -> Result<(), ApiError> {
        self.change_state(ApiVmState::Paused)
    }

    pub fn resume(&self) -> Result<(), ApiError> {
        self.change_state(ApiVmState::Resumed)
    }

    fn change_state(&self, state: ApiVmState) -> Result<(), ApiError> {
        let _span = self.tracing_span.enter();
        info!(?state, "requesting VM state change");
        self.rt.block_on(self.api.patch("/vm", &VmStateChange { state }))
    }

    /// Fetches the VMM's description of the instance.
    pub fn describe(&self) -> Result<InstanceInfo, ApiError> {
        let _span = self.tracing_span.enter();
        self.rt.block_on(self.api.get("/"))
    }

    /// Returns a shell connection to the guest over its network interface.
    pub fn ssh(&self) -> Result<SshConnection> {
        let net = self
            .config
            .network_config()
            .ok_or_else(|| VmStateError::NoNetwork(self.name().to_owned()))?;
        Ok(SshConnection::new(net.guest_ip, "root", self.ssh_key.as_std_path()))
    }

    /// Waits for the guest's ssh daemon and returns a connection to it.
    pub fn wait_for_ssh(&self, timeout: Duration) -> Result<SshConnection> {
        let _span = self.tracing_span.enter();
        let ssh = self.ssh()?;
        ssh.wait_until_ready(timeout)
            .with_context(|| format!("waiting for {} to accept ssh", self.name()))?;
        Ok(ssh)
    }

    /// Returns the guest's serial console.
    pub fn serial(&mut self) -> Result<&mut VmSerialConsole> {
        let name = self.name().to_owned();
        self.serial
            .as_mut()
            .ok_or_else(|| VmStateError::NoSerialConsole(name).into())
    }
}

impl Drop for Microvm {
    fn drop(&mut self) {
        let _span = self.tracing_span.enter();

        // The console's pipes belong to the process, and the jail must not be
        // removed while the VMM still has it open.
        self.serial.take();
        self.process.take();
        self.tap.take();

        if let Err(e) = self.jailer.cleanup() {
            error!("failed to clean up jail: {e:#}");
        }

        info!("VM dropped");
    }
}
