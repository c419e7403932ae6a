//! Cover traffic sources of a running client
//!
//! Every source is its own task with an exponential inter-arrival timer at
//! the policy's `desired_rate`. Policy changes arrive on a watch channel and
//! restart the current wait, which is harmless for a memoryless timer.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{ClientCore, OutboundPacket};
use crate::privacy::cover::{CoverKind, CoverTrafficPolicy};
use crate::privacy::timing::DelaySampler;

/// Loops older than this are forgotten when the in-flight table grows
const LOOP_FORGET_AFTER: Duration = Duration::from_secs(600);
const LOOP_TABLE_SOFT_LIMIT: usize = 1024;

/// Spawns the loop, drop and rate-compliant sources of a client
pub struct CoverTrafficGenerator;

impl CoverTrafficGenerator {
    pub(crate) fn spawn(core: &Arc<ClientCore>) -> Vec<JoinHandle<()>> {
        [CoverKind::Loop, CoverKind::Drop, CoverKind::RateCompliant]
            .into_iter()
            .map(|kind| {
                let policy_rx = core.policy_tx.subscribe();
                let shutdown = core.shutdown_rx();
                tokio::spawn(run_source(Arc::clone(core), kind, policy_rx, shutdown))
            })
            .collect()
    }
}

async fn run_source(
    core: Arc<ClientCore>,
    kind: CoverKind,
    mut policy_rx: watch::Receiver<CoverTrafficPolicy>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut sampler = DelaySampler::new();
    let mut rng = StdRng::from_entropy();

    loop {
        if *shutdown.borrow() {
            break;
        }
        let policy = policy_rx.borrow_and_update().clone();

        if !policy.is_enabled(kind) {
            if kind == CoverKind::RateCompliant {
                flush_queue(&core).await;
            }
            tokio::select! {
                changed = policy_rx.changed() => if changed.is_err() { break },
                _ = shutdown.changed() => break,
            }
            continue;
        }

        let wait = match sampler.next_interval(policy.desired_rate) {
            Ok(wait) => wait,
            Err(e) => {
                tracing::error!("{}: {} cover source stopped: {}", core.config.id, kind.as_str(), e);
                break;
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(wait) => emit(&core, kind, &policy, &mut rng).await,
            changed = policy_rx.changed() => if changed.is_err() { break },
            _ = shutdown.changed() => break,
        }
    }
    tracing::debug!("{}: {} cover source exited", core.config.id, kind.as_str());
}

async fn emit(core: &ClientCore, kind: CoverKind, policy: &CoverTrafficPolicy, rng: &mut StdRng) {
    if kind == CoverKind::RateCompliant {
        let real = core.queue.lock().pop_front();
        if let Some(packet) = real {
            send_real(core, &packet).await;
            return;
        }
    }

    let topology = core.topology.snapshot();
    let built = match kind {
        CoverKind::Loop => {
            let nonce = rng.gen::<u64>();
            let packet = core
                .builder
                .lock()
                .loop_cover(&topology, &core.descriptor, nonce, policy.desired_rate);
            if packet.is_ok() {
                remember_loop(core, nonce);
            }
            packet
        }
        CoverKind::Drop | CoverKind::RateCompliant => {
            core.builder.lock().drop_cover(&topology, kind, policy.desired_rate)
        }
    };

    let packet = match built {
        Ok(packet) => packet,
        Err(e) => {
            tracing::warn!("{}: cannot build {} cover: {}", core.config.id, kind.as_str(), e);
            return;
        }
    };

    match core.transmit(&packet).await {
        Ok(()) => {
            let counter = match kind {
                CoverKind::Loop => &core.counters.loop_sent,
                CoverKind::Drop => &core.counters.drop_sent,
                CoverKind::RateCompliant => &core.counters.rate_cover_sent,
            };
            counter.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("{}: sent {} cover via {}", core.config.id, kind.as_str(), packet.address);
        }
        Err(e) => tracing::warn!("{}: {} cover to {} failed: {}", core.config.id, kind.as_str(), packet.address, e),
    }
}

async fn send_real(core: &ClientCore, packet: &OutboundPacket) {
    match core.transmit(packet).await {
        Ok(()) => {
            core.counters.real_sent.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("{}: sent queued message via {}", core.config.id, packet.address);
        }
        Err(e) => tracing::warn!("{}: queued message to {} failed: {}", core.config.id, packet.address, e),
    }
}

/// Send everything still queued once rate-compliant cover is switched off
async fn flush_queue(core: &ClientCore) {
    loop {
        let next = core.queue.lock().pop_front();
        match next {
            Some(packet) => send_real(core, &packet).await,
            None => break,
        }
    }
}

fn remember_loop(core: &ClientCore, nonce: u64) {
    let mut in_flight = core.loops_in_flight.lock();
    if in_flight.len() >= LOOP_TABLE_SOFT_LIMIT {
        in_flight.retain(|_, sent_at| sent_at.elapsed() < LOOP_FORGET_AFTER);
    }
    in_flight.insert(nonce, Instant::now());
}
