//! Process entrypoint (SPEC_FULL.md §4.6, §6 "Exit codes").
//!
//! Loads the server's TOML configuration, restores any persisted
//! instruction table, spawns the worker pool, and runs the HTTP control
//! plane's accept loop on the main thread until a SIGINT/SIGTERM requests
//! cooperative shutdown (§4.2 "Cancellation").

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use docbuild::{Reporter, Scheduler, StderrReporter, control_plane, spawn_workers};
use docbuild_config::Config;

/// Config load / validation failures exit with this code (§6 "Exit
/// codes": "distinct codes for template-not-found vs. config-not-found
/// vs. generic"). Template rendering itself is out of this core's scope
/// (§1, navigation builder is an external collaborator), so only the
/// config-not-found and generic codes apply here.
const EXIT_CONFIG_ERROR: u8 = 2;
const EXIT_GENERIC_ERROR: u8 = 1;

#[derive(Parser, Debug)]
#[command(name = "docbuild-server", version)]
#[command(about = "Documentation build orchestrator: scheduler, instruction handler, control plane")]
struct Cli {
    /// Path to the server's TOML configuration file.
    #[arg(long, default_value = "/etc/docbuild/docbuild.toml")]
    config: std::path::PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let reporter: Arc<dyn Reporter> = Arc::new(StderrReporter::default());

    let config = match docbuild_config::load_config(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[error] failed to load config {}: {e:#}", cli.config.display());
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let reporter: Arc<dyn Reporter> = Arc::new(StderrReporter::new(config.server.loglevel));
    match run(config, reporter.as_ref()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            reporter.error(&format!("fatal: {e:#}"));
            ExitCode::from(EXIT_GENERIC_ERROR)
        }
    }
}

fn run(config: Config, reporter: &dyn Reporter) -> Result<()> {
    let host_cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let worker_count = config.server.max_threads.resolve(host_cores)?;
    let loglevel = config.server.loglevel;

    let loaded = docbuild_state::load_state(&config.server.cache_dir, &config.server.name, |msg| reporter.warn(msg))
        .context("failed to load persisted state")?;

    reporter.info(&format!(
        "starting docbuild-server '{}' on {}:{} with {worker_count} worker(s), {} restored instruction(s)",
        config.server.name,
        config.server.host,
        config.server.port,
        loaded.len(),
    ));

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let http_server = tiny_http::Server::http(&bind_addr)
        .map_err(|e| anyhow::anyhow!("failed to bind control plane on {bind_addr}: {e}"))?;

    let scheduler = Arc::new(Scheduler::new(config, loaded, reporter));

    let shutdown_scheduler = scheduler.clone();
    ctrlc::set_handler(move || {
        shutdown_scheduler.request_shutdown();
    })
    .context("failed to install signal handler")?;

    let worker_handles = spawn_workers(scheduler.clone(), worker_count, Arc::new(StderrReporter::new(loglevel)));

    control_plane::serve(&http_server, &scheduler, reporter);

    for handle in worker_handles {
        let _ = handle.join();
    }

    reporter.info("docbuild-server shut down cleanly");
    Ok(())
}
