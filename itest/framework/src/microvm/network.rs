// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Point-to-point tap networking between the host and one guest.

use std::{net::Ipv4Addr, process::Command};

use anyhow::Context;
use tracing::{info, warn};

/// The addressing of one guest's tap link. Each link is a /30 holding exactly
/// the host and the guest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkConfig {
    pub tap_name: String,
    pub host_ip: Ipv4Addr,
    pub guest_ip: Ipv4Addr,
    pub guest_mac: String,
}

const NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 252);
const PREFIX_LEN: u8 = 30;

impl NetworkConfig {
    /// Derives a distinct link from `index`: the tap is `itest-tap<index>`
    /// and the link's addresses are `172.16.<index>.1` (host) and
    /// `172.16.<index>.2` (guest).
    pub fn for_index(index: u8) -> Self {
        Self {
            tap_name: format!("itest-tap{index}"),
            host_ip: Ipv4Addr::new(172, 16, index, 1),
            guest_ip: Ipv4Addr::new(172, 16, index, 2),
            guest_mac: format!("06:00:AC:10:{index:02X}:02"),
        }
    }

    /// The kernel command-line fragment that configures the guest's side of
    /// the link at boot.
    pub fn guest_boot_arg(&self) -> String {
        format!("ip={}::{}:{NETMASK}::eth0:off", self.guest_ip, self.host_ip)
    }
}

/// A tap device that exists for as long as this value does.
#[derive(Debug)]
pub struct Tap {
    name: String,
}

impl Tap {
    /// Creates the tap described by `config`, assigns the host address, and
    /// brings the link up.
    pub fn create(config: &NetworkConfig) -> anyhow::Result<Self> {
        let name = config.tap_name.clone();
        info!(tap = %name, host_ip = %config.host_ip, "creating tap device");

        run_ip(&["tuntap", "add", &name, "mode", "tap"])?;
        let tap = Self { name };
        run_ip(&[
            "addr",
            "add",
            &format!("{}/{PREFIX_LEN}", config.host_ip),
            "dev",
            &tap.name,
        ])?;
        run_ip(&["link", "set", &tap.name, "up"])?;
        Ok(tap)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for Tap {
    fn drop(&mut self) {
        if let Err(e) = run_ip(&["link", "del", &self.name]) {
            warn!(tap = %self.name, "failed to remove tap device: {e:#}");
        }
    }
}

fn run_ip(args: &[&str]) -> anyhow::Result<()> {
    let output = Command::new("ip")
        .args(args)
        .output()
        .context("spawning ip")?;

    anyhow::ensure!(
        output.status.success(),
        "`ip {}` failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr).trim()
    );

    Ok(())
}
