// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::time::Duration;

use itest_framework::guest_shell::GuestShell;
use itest_testcase::*;

#[itest_testcase]
fn boot_and_describe_test(ctx: &Framework) {
    let mut config = ctx.default_vm_config("boot_and_describe_test");
    config.network(ctx.next_network());
    let mut vm = ctx.spawn_vm(&config)?;

    vm.configure()?;
    assert_eq!(vm.describe()?.state, "Not started");

    vm.start()?;
    assert_eq!(vm.describe()?.state, "Running");

    let ssh = vm.wait_for_ssh(Duration::from_secs(60))?;
    let nproc = ssh.run("nproc")?;
    assert!(nproc.success(), "nproc failed: {}", nproc.stderr);
    assert_eq!(nproc.stdout.trim().parse::<u8>()?, config.vcpu_count());
}

#[itest_testcase]
fn multiple_vms_test(ctx: &Framework) {
    let mut vms = (0..3)
        .map(|i| {
            let mut config =
                ctx.default_vm_config(&format!("multiple_vms_test_vm{i}"));
            config.network(ctx.next_network());
            ctx.spawn_vm(&config)
        })
        .collect::<Result<Vec<_>, _>>()?;

    for vm in &mut vms {
        vm.launch()?;
    }

    for vm in &vms {
        vm.wait_for_ssh(Duration::from_secs(60))?;
    }
}
