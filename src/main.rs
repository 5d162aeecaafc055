use std::sync::Arc;

use clap::Parser;
use miette::Diagnostic;

use ccvm::cli::{Cli, Command};
use ccvm::commands::{self, Context, CreateOptions};
use ccvm::dispatch::{dispatch, termination_signal};
use ccvm::driver::qemu::QemuDriver;
use ccvm::error::CcvmError;
use ccvm::logging;
use ccvm::workspace::Workspace;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let log_file = logging::init(cli.verbose);

    if let Err(e) = run(cli, log_file).await {
        eprintln!("{e}");
        if let Some(help) = e.help() {
            eprintln!("hint: {help}");
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli, log_file: logging::LogFileHandle) -> Result<(), CcvmError> {
    let workspace = Workspace::prepare(&cli.instance)?;
    tracing::debug!(
        instance = %workspace.instance,
        data_dir = %workspace.data_dir.display(),
        "workspace ready"
    );

    let ctx = Context::new(Arc::new(QemuDriver::new()), workspace).with_log_file(log_file);
    let termination = termination_signal()?;

    match cli.command {
        Command::Create {
            workload,
            vm,
            debug,
            package_upgrade,
        } => {
            let opts = CreateOptions {
                workload,
                overrides: vm.into(),
                debug,
                package_upgrade,
            };
            dispatch(move |cancel| commands::create(ctx, opts, cancel), termination).await
        }
        Command::Start { vm } => {
            let overrides = vm.into();
            dispatch(
                move |cancel| commands::start(ctx, overrides, cancel),
                termination,
            )
            .await
        }
        Command::Stop => dispatch(move |cancel| commands::stop(ctx, cancel), termination).await,
        Command::Quit => dispatch(move |cancel| commands::quit(ctx, cancel), termination).await,
        Command::Status => {
            dispatch(move |cancel| commands::status(ctx, cancel), termination).await
        }
        Command::Connect => {
            dispatch(move |cancel| commands::connect(ctx, cancel), termination).await
        }
        Command::Delete => {
            dispatch(move |cancel| commands::delete(ctx, cancel), termination).await
        }
    }
}
