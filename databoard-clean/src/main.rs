//! DataBoard reconciliation tool.
//!
//! Cleans an e-commerce dataset (a JSON directory or a SQLite database),
//! writes cleaned extracts and a data quality report, and exits non-zero when
//! a rule failed.

use anyhow::Context;
use clap::Parser;
use databoard_clean::{Cli, Command, exit_code, render_plan, render_rules, run_clean, summarize};
use databoard_core::logging::{LogFormat, init_logging_with_format};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let format = if cli.global.log_json {
        LogFormat::Json
    } else {
        LogFormat::Text
    };
    init_logging_with_format(cli.global.verbose, cli.global.quiet, format)?;

    match &cli.command {
        Command::Run(args) => {
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupt received; finishing running rules");
                    on_signal.cancel();
                }
            });

            let outcome = run_clean(args, cancel)
                .await
                .with_context(|| format!("Failed to clean {}", args.input_label()))?;
            if !cli.global.quiet {
                print!("{}", summarize(&outcome));
            }
            info!("Wrote {} extract files", outcome.exports.len());

            let code = exit_code(&outcome.report, args.strict);
            if code != 0 {
                std::process::exit(code);
            }
        }
        Command::Plan(args) => print!("{}", render_plan(args)?),
        Command::Rules(args) => print!("{}", render_rules(args)?),
    }

    Ok(())
}
