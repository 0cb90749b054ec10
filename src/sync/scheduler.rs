use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use super::{SyncEngine, SyncOutcome};
use crate::connectors::MailTransport;

/// Published exactly once per sync attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Completed(SyncOutcome),
    Failed(String),
}

/// Runs at most one sync at a time. A trigger that arrives while a sync is
/// in flight is dropped, not queued.
pub struct SyncScheduler<T> {
    engine: Arc<SyncEngine<T>>,
    running: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<SyncEvent>,
    in_flight: Mutex<Option<JoinHandle<()>>>,
}

impl<T: MailTransport + 'static> SyncScheduler<T> {
    pub fn new(engine: Arc<SyncEngine<T>>) -> (Self, mpsc::UnboundedReceiver<SyncEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let scheduler = Self {
            engine,
            running: Arc::new(AtomicBool::new(false)),
            events,
            in_flight: Mutex::new(None),
        };
        (scheduler, receiver)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Starts a sync unless one is already running; returns whether it started.
    pub fn trigger(&self) -> bool {
        if self.engine.is_cancelled() {
            debug!("scheduler shut down, trigger ignored");
            return false;
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("sync already in flight, trigger dropped");
            return false;
        }

        let engine = Arc::clone(&self.engine);
        let running = Arc::clone(&self.running);
        let events = self.events.clone();

        let handle = tokio::spawn(async move {
            // A panicking sync surfaces here as a JoinError.
            let attempt = tokio::spawn(async move { engine.sync().await }).await;
            let event = match attempt {
                Ok(Ok(outcome)) => SyncEvent::Completed(outcome),
                Ok(Err(err)) => {
                    error!("sync failed: {err}");
                    SyncEvent::Failed(err.to_string())
                }
                Err(join_err) if join_err.is_panic() => {
                    error!("sync task panicked");
                    SyncEvent::Failed("sync task panicked".to_string())
                }
                Err(join_err) => {
                    error!("sync task aborted: {join_err}");
                    SyncEvent::Failed(format!("sync task aborted: {join_err}"))
                }
            };
            running.store(false, Ordering::Release);
            if events.send(event).is_err() {
                debug!("no listener for sync outcome");
            }
        });

        match self.in_flight.lock() {
            Ok(mut slot) => *slot = Some(handle),
            Err(poisoned) => *poisoned.into_inner() = Some(handle),
        }
        true
    }

    /// Triggers on every tick until [`shutdown`](Self::shutdown) is requested.
    /// The first tick fires immediately.
    pub async fn run_periodic(&self, period: Duration) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if self.engine.is_cancelled() {
                break;
            }
            self.trigger();
        }
    }

    /// Stops further triggers and waits for the in-flight sync to commit its
    /// current page and return.
    pub async fn shutdown(&self) {
        self.engine.cancel();
        let handle = match self.in_flight.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!("sync task ended abnormally: {err}");
            }
        }
        info!("sync scheduler stopped");
    }
}
