// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use camino::{Utf8Path, Utf8PathBuf};

use super::network::NetworkConfig;

/// The kernel command line used when a test does not supply one.
pub const DEFAULT_BOOT_ARGS: &str =
    "console=ttyS0 reboot=k panic=1 pci=off";

/// A guest's vsock device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VsockConfig {
    pub guest_cid: u32,

    /// The device's Unix socket, relative to the jail root.
    pub uds_path: String,
}

/// The shape of a VM a test wants to run. Tests usually start from
/// [`crate::Framework::default_vm_config`] and adjust it with the builder
/// methods below.
#[derive(Clone, Debug)]
pub struct VmConfig {
    vm_name: String,
    cpus: u8,
    memory_mib: u32,
    kernel: Utf8PathBuf,
    rootfs: Utf8PathBuf,
    boot_args: String,
    vsock: Option<VsockConfig>,
    network: Option<NetworkConfig>,
    capture_serial: bool,
}

impl VmConfig {
    pub(crate) fn new(
        vm_name: &str,
        cpus: u8,
        memory_mib: u32,
        kernel: &Utf8Path,
        rootfs: &Utf8Path,
    ) -> Self {
        Self {
            vm_name: vm_name.to_owned(),
            cpus,
            memory_mib,
            kernel: kernel.to_owned(),
            rootfs: rootfs.to_owned(),
            boot_args: DEFAULT_BOOT_ARGS.to_owned(),
            vsock: None,
            network: None,
            capture_serial: false,
        }
    }

    pub fn named(&mut self, name: impl ToString) -> &mut Self {
        self.vm_name = name.to_string();
        self
    }

    pub fn cpus(&mut self, cpus: u8) -> &mut Self {
        self.cpus = cpus;
        self
    }

    pub fn memory_mib(&mut self, mem: u32) -> &mut Self {
        self.memory_mib = mem;
        self
    }

    pub fn kernel(&mut self, path: impl Into<Utf8PathBuf>) -> &mut Self {
        self.kernel = path.into();
        self
    }

    pub fn rootfs(&mut self, path: impl Into<Utf8PathBuf>) -> &mut Self {
        self.rootfs = path.into();
        self
    }

    pub fn boot_args(&mut self, args: impl ToString) -> &mut Self {
        self.boot_args = args.to_string();
        self
    }

    /// Adds a vsock device with the given guest CID whose Unix socket is
    /// `uds_path` inside the jail.
    pub fn vsock(&mut self, guest_cid: u32, uds_path: &str) -> &mut Self {
        self.vsock =
            Some(VsockConfig { guest_cid, uds_path: uds_path.to_owned() });
        self
    }

    pub fn network(&mut self, network: NetworkConfig) -> &mut Self {
        self.network = Some(network);
        self
    }

    /// Pipes the VMM's stdin/stdout so the guest's serial console can be
    /// driven with [`super::Microvm::serial`].
    pub fn capture_serial(&mut self, capture: bool) -> &mut Self {
        self.capture_serial = capture;
        self
    }

    pub fn vm_name(&self) -> &str {
        &self.vm_name
    }

    pub fn vcpu_count(&self) -> u8 {
        self.cpus
    }

    pub fn memory_size_mib(&self) -> u32 {
        self.memory_mib
    }

    pub fn kernel_path(&self) -> &Utf8Path {
        &self.kernel
    }

    pub fn rootfs_path(&self) -> &Utf8Path {
        &self.rootfs
    }

    /// The full kernel command line, including any network configuration.
    pub fn kernel_cmdline(&self) -> String {
        match &self.network {
            Some(net) => format!("{} {}", self.boot_args, net.guest_boot_arg()),
            None => self.boot_args.clone(),
        }
    }

    pub fn vsock_config(&self) -> Option<&VsockConfig> {
        self.vsock.as_ref()
    }

    pub fn network_config(&self) -> Option<&NetworkConfig> {
        self.network.as_ref()
    }

    pub fn serial_captured(&self) -> bool {
        self.capture_serial
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_methods_chain() {
        let mut config = VmConfig::new(
            "base",
            1,
            128,
            Utf8Path::new("/k/vmlinux"),
            Utf8Path::new("/r/rootfs.ext4"),
        );
        config
            .named("vsock_test")
            .cpus(2)
            .memory_mib(512)
            .vsock(3, "v.sock")
            .capture_serial(true);

        assert_eq!(config.vm_name(), "vsock_test");
        assert_eq!(config.vcpu_count(), 2);
        assert_eq!(config.memory_size_mib(), 512);
        assert_eq!(
            config.vsock_config(),
            Some(&VsockConfig { guest_cid: 3, uds_path: "v.sock".to_string() })
        );
        assert!(config.serial_captured());
        assert_eq!(config.kernel_cmdline(), DEFAULT_BOOT_ARGS);
    }

    #[test]
    fn network_extends_the_cmdline() {
        let mut config = VmConfig::new(
            "net",
            1,
            128,
            Utf8Path::new("/k"),
            Utf8Path::new("/r"),
        );
        config.boot_args("console=ttyS0").network(NetworkConfig::for_index(1));
        assert_eq!(
            config.kernel_cmdline(),
            "console=ttyS0 ip=172.16.1.2::172.16.1.1:255.255.255.252::eth0:off"
        );
    }
}
