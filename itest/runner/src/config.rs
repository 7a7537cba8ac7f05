// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use itest_framework::log_config::OutputMode;

#[derive(Debug, Subcommand)]
#[allow(clippy::large_enum_variant)]
pub enum Command {
    Run(RunOptions),
    List(ListOptions),
}

/// Boots jailed microVMs and checks them against a catalog of scenarios.
#[derive(Debug, Parser)]
pub struct ProcessArgs {
    #[clap(subcommand)]
    pub command: Command,

    /// Print plain log lines without color escapes.
    #[clap(long, conflicts_with = "emit_bunyan")]
    pub disable_ansi: bool,

    /// Log as newline-delimited Bunyan JSON instead of text.
    #[clap(long)]
    pub emit_bunyan: bool,
}

#[derive(Args, Debug)]
pub struct RunOptions {
    /// The VMM binary the jailer should exec.
    #[clap(long, value_parser)]
    pub firecracker_bin: Utf8PathBuf,

    /// The jailer binary used to launch every VM.
    #[clap(long, value_parser)]
    pub jailer_bin: Utf8PathBuf,

    /// The uncompressed guest kernel used by the default VM config.
    #[clap(long, value_parser)]
    pub kernel: Utf8PathBuf,

    /// The guest root filesystem image used by the default VM config.
    #[clap(long, value_parser)]
    pub rootfs: Utf8PathBuf,

    /// The private key that logs into the guest's root account over ssh.
    #[clap(long, value_parser)]
    pub ssh_key: Utf8PathBuf,

    /// The guest-side vsock helper binary. Tests that exercise vsock devices
    /// are skipped if this is not provided.
    #[clap(long, value_parser)]
    pub vsock_helper: Option<Utf8PathBuf>,

    /// Scratch space for per-VM data directories and vsock test blobs.
    #[clap(long, value_parser)]
    pub tmp_directory: Utf8PathBuf,

    /// The directory under which the jailer creates per-VM chroots.
    #[clap(long, value_parser, default_value = "/srv/jailer")]
    pub chroot_base: Utf8PathBuf,

    /// The user ID jailed VMMs run as.
    #[clap(long, value_parser, default_value = "1234")]
    pub jail_uid: u32,

    /// The group ID jailed VMMs run as.
    #[clap(long, value_parser, default_value = "1234")]
    pub jail_gid: u32,

    /// Destination for each VMM's stdout and stderr: `file` (alias
    /// `tmpfile`) writes into the VM's data directory, `stdio` inherits the
    /// runner's streams, `null` discards them.
    #[clap(long, default_value = "file")]
    pub vmm_output_mode: OutputMode,

    /// vCPUs given to VMs built from the default configuration.
    #[clap(long, value_parser, default_value = "2")]
    pub default_guest_cpus: u8,

    /// Guest memory in MiB for VMs built from the default configuration.
    #[clap(long, value_parser, default_value = "512")]
    pub default_guest_memory_mib: u32,

    /// The first guest CID handed out to VMs with vsock devices. Values below
    /// 3 are reserved and are raised to 3.
    #[clap(long, value_parser, default_value = "3")]
    pub first_guest_cid: u32,

    /// The number of guest CIDs available to a single test.
    #[clap(long, value_parser, default_value = "64")]
    pub guest_cid_count: u32,

    #[clap(flatten)]
    pub filters: TestFilters,
}

#[derive(Args, Debug)]
pub struct ListOptions {
    #[clap(flatten)]
    pub filters: TestFilters,
}

/// Name filters shared by `run` and `list`. A test is selected when its
/// `module::path::name` contains every include pattern and no exclude
/// pattern. Both flags may be repeated.
#[derive(Args, Debug, Default)]
pub struct TestFilters {
    /// Substring a selected test's name must contain.
    #[clap(long = "include-filter", value_parser)]
    pub include: Vec<String>,

    /// Substring a selected test's name must not contain.
    #[clap(long = "exclude-filter", value_parser)]
    pub exclude: Vec<String>,
}

impl TestFilters {
    pub fn select(
        &self,
    ) -> impl Iterator<Item = &'static itest_tests::itest_testcase::TestCase> + '_
    {
        itest_tests::itest_testcase::filtered_test_cases(
            &self.include,
            &self.exclude,
        )
    }
}
