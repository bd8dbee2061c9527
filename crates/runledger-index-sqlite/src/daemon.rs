//! Periodic incremental indexing.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use runledger_core::Deadline;
use serde::Serialize;
use tracing::{error, info};

use crate::indexer::{lease_conflict, Indexer, PassReport};

const SLEEP_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonState {
    Idle,
    Running,
    Failed,
}

impl DaemonState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Running,
            2 => Self::Failed,
            _ => Self::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Running => 1,
            Self::Failed => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Indexed(PassReport),
    /// Another holder owns the lease; nothing was written.
    LeaseBusy { holder: String, expires_at_ms: i64 },
    Failed(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DaemonSummary {
    pub ticks: u64,
    pub passes: u64,
    pub lease_busy: u64,
    pub failures: u64,
    pub events_applied: u64,
}

/// Cancellation and state shared with the thread running the daemon.
#[derive(Debug, Clone, Default)]
pub struct DaemonHandle {
    cancelled: Arc<AtomicBool>,
    state: Arc<AtomicU8>,
}

impl DaemonHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn state(&self) -> DaemonState {
        DaemonState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: DaemonState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }
}

pub struct IndexDaemon {
    indexer: Indexer,
    interval: Duration,
    pass_timeout: Option<Duration>,
    handle: DaemonHandle,
}

impl IndexDaemon {
    #[must_use]
    pub fn new(indexer: Indexer, interval: Duration) -> Self {
        Self {
            indexer,
            interval,
            pass_timeout: None,
            handle: DaemonHandle::default(),
        }
    }

    #[must_use]
    pub fn with_pass_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.pass_timeout = timeout;
        self
    }

    #[must_use]
    pub fn handle(&self) -> DaemonHandle {
        self.handle.clone()
    }

    #[must_use]
    pub fn state(&self) -> DaemonState {
        self.handle.state()
    }

    #[must_use]
    pub fn indexer(&self) -> &Indexer {
        &self.indexer
    }

    /// Runs one incremental pass. Failures are reported, never propagated,
    /// so the loop survives transient errors.
    pub fn tick(&mut self) -> TickOutcome {
        self.handle.set_state(DaemonState::Running);
        let deadline = self.pass_timeout.map_or_else(Deadline::none, Deadline::after);

        let outcome = match self.indexer.run_incremental_pass(None, deadline) {
            Ok(report) => TickOutcome::Indexed(report),
            Err(err) => match lease_conflict(&err) {
                Some((holder, expires_at_ms)) => {
                    info!(holder, expires_at_ms, "index lease busy; skipping tick");
                    TickOutcome::LeaseBusy {
                        holder: holder.to_string(),
                        expires_at_ms,
                    }
                }
                None => {
                    let message = format!("{err:#}");
                    error!(error = %message, "index pass failed");
                    TickOutcome::Failed(message)
                }
            },
        };

        self.handle.set_state(match outcome {
            TickOutcome::Failed(_) => DaemonState::Failed,
            TickOutcome::Indexed(_) | TickOutcome::LeaseBusy { .. } => DaemonState::Idle,
        });
        outcome
    }

    /// Ticks every `interval` until cancelled or until `max_ticks` ticks ran.
    pub fn run(&mut self, max_ticks: Option<u64>) -> DaemonSummary {
        let mut summary = DaemonSummary::default();
        info!(
            interval_ms = u64::try_from(self.interval.as_millis()).unwrap_or(u64::MAX),
            ?max_ticks,
            "index daemon started"
        );

        while !self.handle.is_cancelled() {
            match self.tick() {
                TickOutcome::Indexed(report) => {
                    summary.passes += 1;
                    summary.events_applied += report.stats.applied;
                }
                TickOutcome::LeaseBusy { .. } => summary.lease_busy += 1,
                TickOutcome::Failed(_) => summary.failures += 1,
            }
            summary.ticks += 1;

            if max_ticks.is_some_and(|limit| summary.ticks >= limit) {
                break;
            }
            self.sleep_interval();
        }

        info!(
            ticks = summary.ticks,
            passes = summary.passes,
            failures = summary.failures,
            "index daemon stopped"
        );
        summary
    }

    fn sleep_interval(&self) {
        let until = Instant::now() + self.interval;
        while !self.handle.is_cancelled() {
            let now = Instant::now();
            if now >= until {
                break;
            }
            thread::sleep((until - now).min(SLEEP_SLICE));
        }
    }
}

/// Runs `daemon` on its own thread.
#[must_use]
pub fn spawn(
    mut daemon: IndexDaemon,
    max_ticks: Option<u64>,
) -> (DaemonHandle, JoinHandle<DaemonSummary>) {
    let handle = daemon.handle();
    let join = thread::spawn(move || daemon.run(max_ticks));
    (handle, join)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::IndexLease;
    use runledger_core::{
        EventPayload, EventWriter, LedgerConfig, LogLayout, NewEvent, RunCreatedV2,
        SchemaRegistry,
    };
    use std::path::{Path, PathBuf};
    use ulid::Ulid;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn workspace(label: &str) -> PathBuf {
        std::env::temp_dir().join(format!("runledger-daemon-{label}-{}", Ulid::new()))
    }

    fn seed_runs(dir: &Path, count: usize) {
        let writer = must(EventWriter::open(
            LogLayout::new(dir.join("log")),
            SchemaRegistry::builtin(),
            1024 * 1024,
        ));
        for index in 0..count {
            let payload = EventPayload::RunCreatedV2(RunCreatedV2 {
                kind: "backtest".to_string(),
                config_hash: "sha256:seed".to_string(),
                name: None,
                config: None,
            });
            let run_id = format!("R{index}");
            let input = must(NewEvent::from_payload(
                Some(&run_id),
                runledger_core::now_epoch_ms(),
                &payload,
            ));
            must(writer.append(&input, Deadline::none()));
        }
    }

    fn daemon(dir: &Path, interval: Duration) -> IndexDaemon {
        let indexer = must(Indexer::open(
            &dir.join("log"),
            &dir.join("index.sqlite3"),
            &LedgerConfig::default(),
        ));
        IndexDaemon::new(indexer, interval).with_pass_timeout(Some(Duration::from_secs(30)))
    }

    #[test]
    fn bounded_run_indexes_then_idles() {
        let dir = workspace("bounded");
        seed_runs(&dir, 3);
        let mut daemon = daemon(&dir, Duration::from_millis(10));

        let summary = daemon.run(Some(2));
        assert_eq!(summary.ticks, 2);
        assert_eq!(summary.passes, 2);
        assert_eq!(summary.events_applied, 3);
        assert_eq!(summary.failures, 0);
        assert_eq!(daemon.state(), DaemonState::Idle);
        assert_eq!(must(daemon.indexer().store().counts()).runs, 3);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn busy_lease_skips_the_tick() {
        let dir = workspace("busy");
        seed_runs(&dir, 1);
        let mut daemon = daemon(&dir, Duration::from_millis(10));

        let foreign = IndexLease::for_database(&dir.join("index.sqlite3"), "cli", 60_000);
        let guard = must(foreign.acquire());
        match daemon.tick() {
            TickOutcome::LeaseBusy { holder, .. } => assert_eq!(holder, "cli"),
            other => panic!("expected busy lease, got {other:?}"),
        }
        assert_eq!(daemon.state(), DaemonState::Idle);
        must(guard.release());

        assert!(matches!(daemon.tick(), TickOutcome::Indexed(_)));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn cancelled_daemon_never_ticks() {
        let dir = workspace("cancelled");
        let mut daemon = daemon(&dir, Duration::from_secs(60));
        daemon.handle().cancel();
        assert_eq!(daemon.run(None), DaemonSummary::default());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn spawned_daemon_stops_promptly_on_cancel() {
        let dir = workspace("spawned");
        seed_runs(&dir, 1);
        let (handle, join) = spawn(daemon(&dir, Duration::from_secs(60)), None);

        let watermark = dir.join("index.sqlite3.watermark.json");
        let started = Instant::now();
        while !(watermark.exists() && handle.state() == DaemonState::Idle) {
            if started.elapsed() > Duration::from_secs(10) {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        handle.cancel();

        let summary = match join.join() {
            Ok(summary) => summary,
            Err(_) => panic!("daemon thread panicked"),
        };
        assert!(started.elapsed() < Duration::from_secs(15));
        assert_eq!(summary.ticks, 1);
        assert_eq!(summary.events_applied, 1);
        let _ = std::fs::remove_dir_all(dir);
    }
}
