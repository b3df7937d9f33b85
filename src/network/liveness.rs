//! Liveness
//!
//! Two independent schedules. Clients ping every heartbeat interval while
//! attached; the server watchdog sweeps all sessions periodically, turning
//! lapsed heartbeats into disconnects, ending sessions nobody came back to,
//! and evicting finished ones.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use super::client::{ClientAction, Link};
use super::registry::SessionRegistry;

// =============================================================================
// SERVER WATCHDOG
// =============================================================================

/// Outcome of one sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// (session, nickname) pairs whose heartbeat lapsed
    pub timed_out: Vec<(u32, String)>,
    /// Sessions ended because nobody was connected
    pub abandoned: Vec<u32>,
    /// Sessions removed from the registry
    pub evicted: Vec<u32>,
}

/// Periodic liveness sweep over every session.
pub struct Watchdog {
    registry: Arc<SessionRegistry>,
    heartbeat_timeout: Duration,
    abandoned_grace: Duration,
    ended_linger: Duration,
}

impl Watchdog {
    pub fn new(
        registry: Arc<SessionRegistry>,
        heartbeat_timeout: Duration,
        abandoned_grace: Duration,
        ended_linger: Duration,
    ) -> Self {
        Self {
            registry,
            heartbeat_timeout,
            abandoned_grace,
            ended_linger,
        }
    }

    /// Run one sweep as of `now`.
    pub async fn sweep(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();

        for (id, shared) in self.registry.sessions().await {
            let mut session = shared.lock().await;
            for nickname in session.expire_heartbeats(now, self.heartbeat_timeout) {
                report.timed_out.push((id, nickname));
            }
            if session.check_abandoned(now, self.abandoned_grace) {
                warn!(session = id, "abandoned, ending");
                report.abandoned.push(id);
            }
        }

        report.evicted = self.registry.cleanup(now, self.ended_linger).await;
        report
    }

    /// Sweep every `period` until shutdown.
    #[instrument(skip(self, shutdown_rx))]
    pub async fn run(self, period: Duration, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.sweep(Instant::now()).await;
                    if !report.timed_out.is_empty() || !report.evicted.is_empty() {
                        debug!(?report, "watchdog sweep");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("watchdog stopping");
                    break;
                }
            }
        }
    }
}

// =============================================================================
// CLIENT HEARTBEAT
// =============================================================================

/// Ping the server every `period` until the client goes away or a ping fails.
/// A failed ping reports the lost link and stops the heartbeat.
pub fn spawn_heartbeat(client: Weak<dyn ClientAction>, link: Arc<Link>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick fires immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if link.is_lost() {
                break;
            }
            let Some(client) = client.upgrade() else {
                break;
            };

            match client.ping().await {
                Ok(_) => {}
                Err(e) if e.is_transport() => {
                    warn!(error = %e, "heartbeat failed");
                    link.mark_lost();
                    break;
                }
                // a refused ping still proves the link
                Err(_) => {}
            }
        }
    })
}

// =============================================================================
// TESTS
// =============================================================================
