// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tests that move a VM between its running and paused states.

use std::time::Duration;

use itest_framework::{
    guest_shell::{GuestShell, SshConnection},
    microvm::ApiError,
};
use itest_testcase::*;

fn guest_responds(ssh: &SshConnection) -> Result<bool> {
    Ok(ssh.run("ls")?.success())
}

fn is_bad_request(result: Result<(), ApiError>) -> bool {
    matches!(
        result,
        Err(ApiError::Status { status, .. }) if status.as_u16() == 400
    )
}

#[itest_testcase]
fn pause_resume_test(ctx: &Framework) {
    let mut config = ctx.default_vm_config("pause_resume_test");
    config.network(ctx.next_network());
    let mut vm = ctx.spawn_vm(&config)?;
    vm.configure()?;

    assert!(is_bad_request(vm.pause()));
    assert!(is_bad_request(vm.resume()));

    vm.start()?;
    let ssh = vm.wait_for_ssh(Duration::from_secs(60))?;

    vm.pause()?;
    assert!(!guest_responds(&ssh)?);
    assert_eq!(vm.describe()?.state, "Paused");

    // Pausing twice leaves the VM paused.
    vm.pause()?;
    assert!(!guest_responds(&ssh)?);

    vm.resume()?;
    assert!(guest_responds(&ssh)?);
    assert_eq!(vm.describe()?.state, "Running");

    vm.resume()?;
    assert!(guest_responds(&ssh)?);
}

#[itest_testcase]
fn pause_resume_preboot_test(ctx: &Framework) {
    let config = ctx.default_vm_config("pause_resume_preboot_test");
    let mut vm = ctx.spawn_vm(&config)?;
    vm.configure()?;

    for result in [vm.pause(), vm.resume()] {
        match result {
            Err(ApiError::Status { body, .. }) => assert!(
                body.contains("not supported before starting the microVM"),
                "unexpected rejection: {body}"
            ),
            other => panic!("pre-boot state change was not rejected: {other:?}"),
        }
    }
}
