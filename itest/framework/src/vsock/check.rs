// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The host-initiated and guest-initiated round-trip scenarios.

use std::path::Path;

use anyhow::Context;
use thiserror::Error;
use tracing::{error, info, info_span};

use super::{
    host_port_path, run_echo_workers, Blob, EchoServer, EchoServerError,
    GuestPortConnector, WorkerResult, BLOB_SIZE, ECHO_SERVER_PORT,
    GUEST_BLOB_PATH, TEST_CONNECTION_COUNT,
};
use crate::{fingerprint::Fingerprint, guest_shell::GuestShell, Microvm};

/// The host's vsock CID as seen from inside the guest.
const HOST_CID: u32 = 2;

/// Raised so the guest can fork a shell per worker without hitting the ssh
/// service's pids limit.
const GUEST_PIDS_MAX_CMD: &str =
    "echo 1024 > /sys/fs/cgroup/pids/system.slice/ssh.service/pids.max";

/// Ways a round-trip check can fail. Transfer errors, content mismatches, and
/// server faults are reported separately.
#[derive(Debug, Error)]
pub enum RoundTripError {
    #[error(
        "{} of {total} vsock workers failed to transfer: {}",
        .failures.len(),
        describe_failures(.failures)
    )]
    TransferFailed { total: usize, failures: Vec<(usize, String)> },

    #[error(
        "{} of {total} vsock workers echoed data not matching {expected}: {}",
        .mismatches.len(),
        describe_mismatches(.mismatches)
    )]
    ContentMismatch {
        total: usize,
        expected: Fingerprint,
        mismatches: Vec<(usize, Fingerprint)>,
    },

    #[error("host echo server fault: {0}")]
    ServerFault(#[from] EchoServerError),

    #[error("guest command `{command}` exited with status {exit_code}")]
    GuestCommand { command: String, exit_code: i32 },

    #[error("could not run guest command `{command}`: {reason}")]
    GuestShell { command: String, reason: String },
}

fn describe_failures(failures: &[(usize, String)]) -> String {
    failures
        .iter()
        .map(|(id, e)| format!("[worker {id}: {e}]"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn describe_mismatches(mismatches: &[(usize, Fingerprint)]) -> String {
    mismatches
        .iter()
        .map(|(id, fp)| format!("[worker {id}: {fp}]"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Checks every worker result against `expected`. Transfer failures are
/// reported ahead of mismatches.
pub fn verify_worker_results(
    results: &[WorkerResult],
    expected: Fingerprint,
) -> Result<(), RoundTripError> {
    let total = results.len();
    let mut failures = Vec::new();
    let mut mismatches = Vec::new();
    for result in results {
        match &result.outcome {
            Ok(fp) if *fp == expected => {}
            Ok(fp) => mismatches.push((result.worker_id, *fp)),
            Err(e) => failures.push((result.worker_id, e.to_string())),
        }
    }

    if !failures.is_empty() {
        return Err(RoundTripError::TransferFailed { total, failures });
    }

    if !mismatches.is_empty() {
        return Err(RoundTripError::ContentMismatch {
            total,
            expected,
            mismatches,
        });
    }

    Ok(())
}

fn run_guest_command(
    shell: &dyn GuestShell,
    command: &str,
) -> Result<(), RoundTripError> {
    let output = shell.run(command).map_err(|e| RoundTripError::GuestShell {
        command: command.to_owned(),
        reason: format!("{e:#}"),
    })?;

    if output.exit_code != 0 {
        return Err(RoundTripError::GuestCommand {
            command: command.to_owned(),
            exit_code: output.exit_code,
        });
    }

    Ok(())
}

/// Host-initiated connections: starts the echo service in the guest, then
/// pushes `blob` through [`TEST_CONNECTION_COUNT`] concurrent connections made
/// through the vsock device's socket at `uds_path`.
pub fn check_host_connections(
    shell: &dyn GuestShell,
    uds_path: &Path,
    blob: &Blob,
) -> Result<(), RoundTripError> {
    let span = info_span!("vsock host-initiated", uds_path = %uds_path.display());
    let _guard = span.enter();

    run_guest_command(
        shell,
        &format!("vsock_helper echosrv -d {ECHO_SERVER_PORT}"),
    )?;

    let connector = GuestPortConnector::new(uds_path, ECHO_SERVER_PORT);
    info!(workers = TEST_CONNECTION_COUNT, "starting host echo workers");
    let results =
        run_echo_workers(&connector, blob.path(), TEST_CONNECTION_COUNT);

    verify_worker_results(&results, blob.fingerprint())?;
    info!("all host-initiated round trips matched");
    Ok(())
}

/// Builds the guest shell script that runs `count` concurrent workers. Each
/// worker streams the blob through `vsock_helper` to the host's echo server,
/// hashes the reply, and fails if the hash differs from `expected`. The script
/// exits non-zero if any worker fails.
pub fn guest_worker_script(
    guest_blob_path: &str,
    port: u32,
    expected: Fingerprint,
    count: usize,
) -> String {
    let worker = format!(
        "hash=$(cat {guest_blob_path} | vsock_helper echo {HOST_CID} {port} \
         | md5sum | cut -f1 -d\\ ) && [[ \"$hash\" = \"{expected}\" ]]"
    );

    format!(
        "workers=\"\";\
         for i in $(seq 1 {count}); do  ({worker})&   workers=\"$workers $!\";done;\
         for w in $workers; do wait $w || exit -1; done"
    )
}

/// Guest-initiated connections: starts `server` (already bound where the VMM
/// will look for host port [`ECHO_SERVER_PORT`]), runs the worker script in
/// the guest, then stops the server.
///
/// The server's fault status and the script's exit status are checked
/// independently; both are logged even when only the first is returned.
pub fn check_guest_connections(
    shell: &dyn GuestShell,
    mut server: EchoServer,
    guest_blob_path: &str,
    expected: Fingerprint,
) -> Result<(), RoundTripError> {
    let span = info_span!(
        "vsock guest-initiated",
        server_path = %server.path().display()
    );
    let _guard = span.enter();

    server.start()?;

    let script = guest_worker_script(
        guest_blob_path,
        ECHO_SERVER_PORT,
        expected,
        TEST_CONNECTION_COUNT,
    );

    let guest_result = run_guest_command(shell, GUEST_PIDS_MAX_CMD)
        .and_then(|()| run_guest_command(shell, &script));

    let server_result = server.stop();

    if let Err(e) = &guest_result {
        error!(%e, "guest workers failed");
    }

    server_result?;
    guest_result?;
    info!("all guest-initiated round trips matched");
    Ok(())
}

/// Runs both scenarios against a running VM with a vsock device whose socket
/// sits at its jail root (normally [`super::VSOCK_UDS_PATH`]). `vsock_helper` is the
/// guest-side helper binary on the host.
pub fn check_vsock_device(
    vm: &Microvm,
    vsock_helper: &Path,
) -> anyhow::Result<()> {
    check_vsock_device_with_blob_size(vm, vsock_helper, BLOB_SIZE)
}

pub fn check_vsock_device_with_blob_size(
    vm: &Microvm,
    vsock_helper: &Path,
    blob_size: usize,
) -> anyhow::Result<()> {
    let vsock = vm.config().vsock_config().with_context(|| {
        format!("VM {} has no vsock device", vm.name())
    })?;
    let uds_name = vsock.uds_path.trim_start_matches('/');
    anyhow::ensure!(
        !uds_name.contains('/'),
        "vsock socket {} is not at the jail root",
        vsock.uds_path
    );

    let blob = Blob::create(vm.data_dir(), blob_size)?;
    let ssh = vm.ssh()?;

    let mount_cmd = format!(
        "mkdir -p /tmp/vsock && mount -t tmpfs tmpfs -o size={} /tmp/vsock",
        blob_size + 1024 * 1024
    );
    let output = ssh.run(&mount_cmd)?;
    anyhow::ensure!(
        output.success(),
        "failed to set up tmpfs on the guest: {}",
        output.stderr
    );

    ssh.copy_to_guest(vsock_helper, "/bin/vsock_helper")
        .context("copying vsock helper to guest")?;
    ssh.copy_to_guest(blob.path(), GUEST_BLOB_PATH)
        .context("copying blob to guest")?;

    // The server is bound outside the jail and hard-linked in, where the VMM
    // looks for `<uds_path>_<port>`.
    let server_path =
        host_port_path(vm.data_dir().join(uds_name), ECHO_SERVER_PORT);
    let server = EchoServer::bind(&server_path).with_context(|| {
        format!("binding echo server at {}", server_path.display())
    })?;
    vm.create_jailed_resource(&server_path)?;
    check_guest_connections(&ssh, server, GUEST_BLOB_PATH, blob.fingerprint())?;

    let uds_path = vm.jailer().jailed_path(uds_name);
    check_host_connections(&ssh, uds_path.as_std_path(), &blob)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vsock::VsockError;

    fn result(id: usize, outcome: Result<Fingerprint, VsockError>) -> WorkerResult {
        WorkerResult { worker_id: id, outcome }
    }

    #[test]
    fn all_matching_results_pass() {
        let fp = Fingerprint::of_bytes(b"blob");
        let results: Vec<_> = (0..5).map(|i| result(i, Ok(fp))).collect();
        verify_worker_results(&results, fp).unwrap();
    }

    #[test]
    fn transfer_failures_are_reported_before_mismatches() {
        let fp = Fingerprint::of_bytes(b"blob");
        let other = Fingerprint::of_bytes(b"not the blob");
        let results = vec![
            result(0, Ok(fp)),
            result(1, Ok(other)),
            result(
                2,
                Err(VsockError::Handshake("BAD\n".to_string())),
            ),
        ];

        match verify_worker_results(&results, fp) {
            Err(RoundTripError::TransferFailed { total, failures }) => {
                assert_eq!(total, 3);
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].0, 2);
            }
            other => panic!("unexpected result {other:?}"),
        }

        match verify_worker_results(&results[..2], fp) {
            Err(RoundTripError::ContentMismatch { mismatches, .. }) => {
                assert_eq!(mismatches, vec![(1, other)]);
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn worker_script_shape() {
        let fp = Fingerprint::of_bytes(b"");
        let script = guest_worker_script("/tmp/vsock/test.blob", 5252, fp, 50);
        assert!(script.starts_with("workers=\"\";for i in $(seq 1 50); do"));
        assert!(script.contains(
            "cat /tmp/vsock/test.blob | vsock_helper echo 2 5252 | md5sum"
        ));
        assert!(script.contains(&format!("[[ \"$hash\" = \"{fp}\" ]]")));
        assert!(script.ends_with("for w in $workers; do wait $w || exit -1; done"));
    }
}
