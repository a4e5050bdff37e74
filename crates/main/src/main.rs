/*
 * SPDX-FileCopyrightText: 2025 Postrider Project <hello@postrider.dev>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use mta::config::Config;
use mta::core::{Core, Zone};
use mta::outbound::delivery::{Worker, WorkerHandle};
use mta::queue::client::QueueClient;
use mta::timers;
use tokio::sync::Mutex;

const RESTART_DELAY: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/postrider/config.toml".to_string());
    let config = Config::load(&config_path).map_err(anyhow::Error::msg)?;

    let level = config
        .log
        .level
        .parse::<tracing::Level>()
        .map_err(|_| anyhow::anyhow!("Invalid log level {:?}", config.log.level))?;
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(level)
            .finish(),
    )
    .context("Failed to install tracing subscriber")?;

    let core = Arc::new(Core::new(config).map_err(anyhow::Error::msg)?);
    if core.zones.is_empty() {
        anyhow::bail!("No zones configured; nothing to deliver");
    }

    let _flush = timers::spawn_flush(core.timers.clone(), core.timers_flush_interval);

    // One supervisor task per worker slot. Each respawns its worker after a
    // fatal queue-channel error until shutdown begins.
    let shutting_down = Arc::new(AtomicBool::new(false));
    let handles = Arc::new(Mutex::new(Vec::<WorkerHandle>::new()));
    let mut supervisors = Vec::new();
    for zone in &core.zones {
        for slot in 0..zone.workers {
            supervisors.push(tokio::spawn(supervise(
                core.clone(),
                zone.clone(),
                slot,
                shutting_down.clone(),
                handles.clone(),
            )));
        }
    }
    tracing::info!(
        context = "server",
        event = "started",
        zones = core.zones.len(),
        workers = supervisors.len(),
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!(context = "server", event = "shutdown");

    shutting_down.store(true, Ordering::Relaxed);
    for handle in handles.lock().await.iter() {
        handle.close();
    }
    for supervisor in supervisors {
        let _ = supervisor.await;
    }

    Ok(())
}

async fn supervise(
    core: Arc<Core>,
    zone: Arc<Zone>,
    slot: usize,
    shutting_down: Arc<AtomicBool>,
    handles: Arc<Mutex<Vec<WorkerHandle>>>,
) {
    while !shutting_down.load(Ordering::Relaxed) {
        match QueueClient::connect(
            &core.queue_addr,
            zone.name.clone(),
            core.queue_timeout,
            core.timers.clone(),
        )
        .await
        {
            Ok(queue) => {
                let worker = Worker::new(core.clone(), zone.clone(), queue);
                handles.lock().await.push(worker.handle());
                match worker.run().await {
                    Ok(()) => break,
                    Err(err) => {
                        tracing::error!(
                            context = "worker",
                            event = "failed",
                            zone = zone.name.as_str(),
                            slot = slot,
                            reason = %err,
                        );
                    }
                }
            }
            Err(err) => {
                tracing::error!(
                    context = "worker",
                    event = "connect-failed",
                    zone = zone.name.as_str(),
                    slot = slot,
                    reason = %err,
                );
            }
        }
        tokio::time::sleep(RESTART_DELAY).await;
    }
}
