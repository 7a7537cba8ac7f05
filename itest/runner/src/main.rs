// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

mod config;
mod execute;

use anyhow::Context;
use clap::Parser;
use config::{Command, ListOptions, ProcessArgs, RunOptions};
use itest_framework::log_config::{LogConfig, LogFormat};
use itest_tests::itest_testcase::{Framework, FrameworkParameters};
use tracing::{debug, error, info};
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

use crate::execute::ExecutionStats;

fn main() -> anyhow::Result<()> {
    let args = ProcessArgs::parse();
    init_logging(&args)?;
    set_panic_hook();
    info!(?args, "itest-runner starting");

    match &args.command {
        Command::Run(opts) => {
            let failed = run_tests(opts, &args)?.tests_failed;
            debug!(failed, "exiting with the failed test count");
            std::process::exit(i32::try_from(failed).unwrap_or(i32::MAX));
        }
        Command::List(opts) => list_tests(opts),
    }

    Ok(())
}

fn run_tests(
    run_opts: &RunOptions,
    runner_args: &ProcessArgs,
) -> anyhow::Result<ExecutionStats> {
    let params = FrameworkParameters {
        firecracker: run_opts.firecracker_bin.clone(),
        jailer: run_opts.jailer_bin.clone(),
        kernel: run_opts.kernel.clone(),
        rootfs: run_opts.rootfs.clone(),
        ssh_key: run_opts.ssh_key.clone(),
        vsock_helper: run_opts.vsock_helper.clone(),
        tmp_directory: run_opts.tmp_directory.clone(),
        chroot_base: run_opts.chroot_base.clone(),
        jail_uid: run_opts.jail_uid,
        jail_gid: run_opts.jail_gid,
        // The log format applies to the runner's own output as well as to the
        // processes it starts.
        log_config: LogConfig {
            output_mode: run_opts.vmm_output_mode,
            log_format: if runner_args.emit_bunyan {
                LogFormat::Bunyan
            } else {
                LogFormat::Plain
            },
        },
        default_guest_cpus: run_opts.default_guest_cpus,
        default_guest_memory_mib: run_opts.default_guest_memory_mib,
        guest_cid_range: run_opts.first_guest_cid
            ..run_opts.first_guest_cid.saturating_add(run_opts.guest_cid_count),
    };

    let ctx =
        Framework::new(params).context("setting up the test framework")?;

    let stats = execute::run_tests_with_ctx(&ctx, run_opts);
    stats.print_summary();

    Ok(stats)
}

fn list_tests(list_opts: &ListOptions) {
    println!("Selected tests:\n");
    let names: Vec<String> = list_opts
        .filters
        .select()
        .map(|tc| tc.fully_qualified_name())
        .collect();
    for name in &names {
        println!("    {name}");
    }

    println!("\n{} test(s) selected", names.len());
}

fn init_logging(args: &ProcessArgs) -> anyhow::Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into())
        .from_env_lossy();
    let registry = Registry::default().with(env_filter);
    if args.emit_bunyan {
        let json = BunyanFormattingLayer::new(
            "itest-runner".to_string(),
            std::io::stdout,
        );
        tracing::subscriber::set_global_default(
            registry.with(JsonStorageLayer).with(json),
        )?;
    } else {
        let text = tracing_subscriber::fmt::layer()
            .with_line_number(true)
            .with_ansi(!args.disable_ansi);
        tracing::subscriber::set_global_default(registry.with(text))?;
    }

    Ok(())
}

/// Logs panics with a backtrace. Panicking test bodies are still reported as
/// failures afterwards.
fn set_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let bt = backtrace::Backtrace::new();
        error!("{info}\n{bt:?}");
    }));
}
