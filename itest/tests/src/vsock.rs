// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::time::Duration;

use itest_framework::vsock::{check_vsock_device, VSOCK_UDS_PATH};
use itest_testcase::*;
use tracing::info;

#[itest_testcase]
fn vsock_round_trip_test(ctx: &Framework) {
    let Some(helper) = ctx.vsock_helper() else {
        itest_skip!("no vsock helper binary was supplied");
    };

    let mut config = ctx.default_vm_config("vsock_round_trip_test");
    config
        .vsock(ctx.next_guest_cid()?, VSOCK_UDS_PATH)
        .network(ctx.next_network());
    let mut vm = ctx.spawn_vm(&config)?;
    vm.launch()?;
    vm.wait_for_ssh(Duration::from_secs(60))?;
    info!(%helper, cid = config.vsock_config().map(|v| v.guest_cid), "guest is up");

    check_vsock_device(&vm, helper.as_std_path())?;
}
