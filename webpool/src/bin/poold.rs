//! Pool daemon: wires the collaborators together and runs the stratum
//! server, template refresh loop and block unlocker until shutdown.

use std::sync::Arc;

use tokio::signal::unix::{self, SignalKind};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use webpool::config::Config;
use webpool::payouts::BlockUnlocker;
use webpool::policy::Policy;
use webpool::pow::DevHasher;
use webpool::rpc::HttpNodeRpc;
use webpool::storage::MemoryBackend;
use webpool::stratum::StratumServer;
use webpool::template::{self, TemplateCache};
use webpool::tracing::prelude::*;
use webpool::{tracing, util};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing::init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.json".to_string());
    let config = Config::load(&config_path)?;

    let backend = Arc::new(MemoryBackend::new());
    let policy = Arc::new(Policy::new(config.proxy.policy.clone())?);
    let upstream = Arc::new(HttpNodeRpc::new(
        config.upstream.name.clone(),
        config.upstream.url.clone(),
        util::parse_duration(&config.upstream.timeout)?,
    )?);
    let templates = Arc::new(TemplateCache::new());

    warn!("verifying shares with the development hasher; production deployments bind the chain's hashing library");
    let hasher = Arc::new(DevHasher);

    let shutdown = CancellationToken::new();
    let tracker = TaskTracker::new();

    let refresh = util::parse_duration(&config.proxy.block_refresh_interval)?;
    tracker.spawn(template::poll_templates(
        templates.clone(),
        upstream.clone(),
        refresh,
        shutdown.clone(),
    ));

    let server = StratumServer::new(
        config.proxy.clone(),
        hasher,
        upstream.clone(),
        backend.clone(),
        policy,
        templates.clone(),
    )?;
    tracker.spawn(
        server
            .clone()
            .run_broadcaster(templates.subscribe(), shutdown.clone()),
    );
    tracker.spawn({
        let server = server.clone();
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = server.listen(shutdown).await {
                error!(error = %e, "stratum server failed");
            }
        }
    });

    if config.unlocker.enabled {
        let node = Arc::new(HttpNodeRpc::new(
            "BlockUnlocker",
            config.unlocker.daemon.clone(),
            util::parse_duration(&config.unlocker.timeout)?,
        )?);
        let unlocker = BlockUnlocker::new(config.unlocker.clone(), backend.clone(), node)?;
        tracker.spawn(unlocker.run(shutdown.clone()));
    }

    tracker.close();
    info!("started");

    let mut sigint = unix::signal(SignalKind::interrupt())?;
    let mut sigterm = unix::signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }

    shutdown.cancel();
    tracker.wait().await;
    info!("exiting");
    Ok(())
}
