//! Binary entrypoint: wire the runtime together, wait for a termination
//! signal, shut down cleanly.

use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tonebridge::adapters::hqp::HqpAdapter;
use tonebridge::adapters::lms::LmsAdapter;
use tonebridge::adapters::traits::AdapterLogic;
use tonebridge::aggregator::ZoneAggregator;
use tonebridge::api::Bridge;
use tonebridge::bus::EventBus;
use tonebridge::config;
use tonebridge::coordinator::AdapterCoordinator;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tonebridge=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(build = env!("TONEBRIDGE_BUILD"), "starting tonebridge");

    let cfg = config::load_config()?;

    let bus = EventBus::shared();
    let aggregator = Arc::new(ZoneAggregator::new(bus.clone()));
    {
        let aggregator = aggregator.clone();
        tokio::spawn(async move { aggregator.run().await });
    }

    let coordinator = Arc::new(AdapterCoordinator::with_grace(bus.clone(), cfg.grace()));

    let hqp = Arc::new(HqpAdapter::new(bus.clone()));
    if let Some(hqp_cfg) = cfg.hqplayer.as_ref() {
        hqp.configure(hqp_cfg.host.clone(), hqp_cfg.port).await;
    }
    coordinator
        .register(hqp.clone() as Arc<dyn AdapterLogic>, cfg.hqp_enabled())
        .await;

    let lms = Arc::new(LmsAdapter::new(bus.clone()));
    if let Some(lms_cfg) = cfg.lms.as_ref() {
        lms.configure(
            lms_cfg.host.clone(),
            lms_cfg.port,
            lms_cfg.username.clone(),
            lms_cfg.password.clone(),
        )
        .await;
    }
    coordinator
        .register(lms.clone() as Arc<dyn AdapterLogic>, cfg.lms_enabled())
        .await;

    coordinator.start_enabled().await?;

    // The Bridge is what an HTTP/SSE layer mounts on top of this process.
    let _bridge = Bridge::new(
        bus.clone(),
        aggregator.clone(),
        coordinator.clone(),
        hqp,
        lms,
    );

    wait_for_termination().await;
    tracing::info!("termination signal received");

    coordinator.shutdown().await;
    tracing::info!("bye");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(e) => {
            tracing::warn!("cannot listen for SIGTERM: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    let _ = tokio::signal::ctrl_c().await;
}
