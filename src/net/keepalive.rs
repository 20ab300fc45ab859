//! Periodic keepalive emission.
//!
//! # Responsibilities
//! - Send a one-byte `KeepAlive` frame every interval while connected
//! - Restart the period when the interval changes (never fire immediately)
//! - Detect a silent peer when a disconnect timeout is configured
//!
//! # Disposal
//! A tick holds `gate` for the whole send. `dispose` takes the same lock
//! and marks the timer disposed, so a tick can never run concurrently with
//! or after teardown of its connection. A send that stalls longer than
//! [`STALLED_SEND_TIMEOUT`] is abandoned and the connection is closed, which
//! bounds how long `dispose` can wait.
//!
//! Ticks follow wall-clock time, independent of other traffic.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::net::connection::{Connection, DisconnectReason};
use crate::net::wire::SendOption;

pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_millis(10_000);

/// Upper bound on a single keepalive write.
pub const STALLED_SEND_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Default)]
struct TimerGate {
    disposed: bool,
}

enum Tick {
    Continue,
    Stop,
}

#[derive(Debug)]
pub struct KeepaliveTimer {
    gate: Arc<tokio::sync::Mutex<TimerGate>>,
    interval_tx: watch::Sender<Option<Duration>>,
    started: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl KeepaliveTimer {
    /// `None` creates a disabled timer.
    pub fn new(interval: Option<Duration>) -> Self {
        let (interval_tx, _) = watch::channel(interval.filter(|i| !i.is_zero()));
        Self {
            gate: Arc::new(tokio::sync::Mutex::new(TimerGate::default())),
            interval_tx,
            started: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Option<Duration> {
        *self.interval_tx.borrow()
    }

    /// Reschedule the next tick one full `interval` from now. `None` (or a
    /// zero duration) suppresses all future ticks.
    pub fn set_interval(&self, interval: Option<Duration>) {
        self.interval_tx.send_replace(interval.filter(|i| !i.is_zero()));
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Start ticking against `target`. Only the first call has an effect.
    pub fn start(&self, target: Weak<dyn Connection>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let gate = Arc::clone(&self.gate);
        let interval_rx = self.interval_tx.subscribe();
        let handle = tokio::spawn(run(gate, interval_rx, target));
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Stop the timer for good. Waits for an in-flight tick to finish.
    pub async fn dispose(&self) {
        let mut gate = self.gate.lock().await;
        gate.disposed = true;
        if let Some(task) = self.task.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }

    pub async fn is_disposed(&self) -> bool {
        self.gate.lock().await.disposed
    }
}

impl Drop for KeepaliveTimer {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }
}

async fn run(
    gate: Arc<tokio::sync::Mutex<TimerGate>>,
    mut interval_rx: watch::Receiver<Option<Duration>>,
    target: Weak<dyn Connection>,
) {
    loop {
        let interval = *interval_rx.borrow_and_update();
        let Some(period) = interval else {
            if interval_rx.changed().await.is_err() {
                return;
            }
            continue;
        };

        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Tick::Stop = fire(&gate, &target).await {
                        return;
                    }
                }
                changed = interval_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    break;
                }
            }
        }
    }
}

async fn fire(gate: &tokio::sync::Mutex<TimerGate>, target: &Weak<dyn Connection>) -> Tick {
    let guard = gate.lock().await;
    if guard.disposed {
        return Tick::Stop;
    }
    let Some(connection) = target.upgrade() else {
        return Tick::Stop;
    };

    if connection.core().peer_timed_out() {
        // Closing disposes this timer, which needs the gate.
        drop(guard);
        tracing::warn!(
            connection_id = %connection.core().id(),
            endpoint = %connection.endpoint(),
            silence_ms = connection.core().silence().as_millis() as u64,
            "Peer silent past disconnect timeout"
        );
        tokio::spawn(async move {
            connection.close_with(DisconnectReason::Timeout).await;
        });
        return Tick::Stop;
    }

    match time::timeout(STALLED_SEND_TIMEOUT, connection.send(&[], SendOption::KeepAlive)).await {
        Ok(Ok(())) => Tick::Continue,
        // Best effort: a closed socket or a lost race with shutdown is expected.
        Ok(Err(e)) => {
            tracing::trace!(
                connection_id = %connection.core().id(),
                error = %e,
                "Keepalive not sent"
            );
            Tick::Continue
        }
        Err(_) => {
            // A frame may be half written; the stream cannot be reused.
            drop(guard);
            tracing::warn!(
                connection_id = %connection.core().id(),
                endpoint = %connection.endpoint(),
                timeout_ms = STALLED_SEND_TIMEOUT.as_millis() as u64,
                "Keepalive send stalled"
            );
            tokio::spawn(async move {
                connection
                    .close_with(DisconnectReason::Error("keepalive send stalled".to_string()))
                    .await;
            });
            Tick::Stop
        }
    }
}
