// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use itest_framework::{
    microvm::DEFAULT_BOOT_ARGS,
    serial::{run_session, CommandSequence, SerialTx, SessionState},
};
use itest_testcase::*;

#[itest_testcase]
fn serial_console_login_test(ctx: &Framework) {
    let mut config = ctx.default_vm_config("serial_console_login_test");
    config.cpus(1).boot_args(DEFAULT_BOOT_ARGS).capture_serial(true);
    let mut vm = ctx.spawn_vm(&config)?;
    vm.launch()?;

    let session = SessionState::login(
        "ubuntu-fc-uvm:",
        "id",
        "uid=0(root) gid=0(root) groups=0(root)",
    );
    run_session(vm.serial()?, session)
        .context("driving the serial login session")?;
}

#[itest_testcase]
fn serial_root_login_sequence_test(ctx: &Framework) {
    if !cfg!(target_arch = "x86_64") {
        itest_skip!("guest images on this architecture log in automatically");
    }

    let mut config = ctx.default_vm_config("serial_root_login_sequence_test");
    config.capture_serial(true);
    let mut vm = ctx.spawn_vm(&config)?;
    vm.launch()?;

    let console = vm.serial()?;
    console.run_sequence(&CommandSequence::root_login())?;
    console.tx("whoami")?;
    console.rx("root")?;
}
