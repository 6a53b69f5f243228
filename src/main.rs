//! oopsnote - HTTP Server Entry Point
//!
//! Starts the HTTP server that exposes the task API.

use oopsnote::{api, config::Config};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("oopsnote-worker")
        .build()?;
    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "oopsnote=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(
        "Loaded configuration: provider={:?} model={} data_dir={}",
        config.provider.kind,
        config.provider.model,
        config.data_dir.display()
    );
    for (stage, provider) in &config.stage_providers {
        info!("Stage {} uses {:?} model {}", stage, provider.kind, provider.model);
    }

    info!("Starting server on {}", config.bind_addr());
    api::serve(config).await?;

    Ok(())
}
