use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use docgate_core::process::{CommandLauncher, Supervisor};
use tracing::info;
use tracing_subscriber::{filter::LevelFilter, fmt, prelude::*, EnvFilter};

use crate::{
    config::Config,
    server::{Command, Manager, ReusePortListenerBuilder},
};

mod config;
mod context;
mod factory;
mod server;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path of the config file
    #[clap(short, long, value_parser)]
    config: String,
}

#[monoio::main(timer_enabled = true)]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config)?;

    let supervisor = Supervisor::start(
        config.engines.clone(),
        config.supervisor,
        Arc::new(CommandLauncher),
    )?;
    info!("supervising {} engines", config.engines.len());

    let result = run(&config, supervisor.clone()).await;
    // children must not outlive us
    supervisor.shutdown();
    result
}

async fn run(config: &Config, supervisor: Supervisor) -> Result<()> {
    // Start workers
    let mut manager = Manager::new(config.runtime.clone());
    let workers = manager.spawn_workers()?;
    info!("{} workers started", workers.len());

    // Construct Service Factory and Listener Factory
    let factory = factory::docgate_factory(
        config.site(),
        config.routes.clone(),
        supervisor,
        config.timeouts.into(),
    );
    let listener = ReusePortListenerBuilder {
        addr: config.server.listen,
    };

    // Broadcast Add command to worker threads
    let results = manager
        .apply(Command::Add(
            "docgate".to_string(),
            Arc::new(factory),
            Arc::new(listener),
        ))
        .await;
    for r in results {
        r?;
    }
    info!("listening on {}", config.server.listen);

    monoio::utils::CtrlC::new()?.await;
    info!("shutting down");
    Ok(())
}
