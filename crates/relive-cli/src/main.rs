//! relive CLI - run a script and restart it whenever its sources change

mod cli;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use cli::Cli;
use colored::Colorize;
use relive_kernel::ModuleRegistry;
use relive_reload::{RhaiEntryPoint, WatchLoop};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cli))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cli.watch_loop_config()?;
    let roots = cli.watch_roots();

    let registry = Arc::new(
        ModuleRegistry::from_current_dir().context("Failed to read the working directory")?,
    );
    let loader = Arc::new(RhaiEntryPoint::new().with_frame_rate(cli.frame_rate));

    let mut watch_loop = WatchLoop::new(&cli.entry_point, &roots, loader, registry, config)
        .with_context(|| format!("Cannot watch {}", cli.entry_point.display()))?;

    println!(
        "{} {} ({} files, Ctrl-C to quit)",
        "Watching".green().bold(),
        cli.entry_point.display(),
        watch_loop.watch_set().len()
    );

    watch_loop
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("Cannot listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await;

    println!("{}", "Stopped".yellow());
    Ok(())
}
