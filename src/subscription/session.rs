//! Live value session.
//!
//! A [`LiveSession`] owns the delivery channel of one subscription and moves
//! through these states:
//!
//! ```text
//! idle -> connecting -> open <-> reconnecting -> failed
//!                  \______________^
//! stopped: from any state, on `stop()`
//! ```
//!
//! Push mode re-establishes a lost channel with exponential backoff until the
//! [`ReconnectPolicy`] is exhausted. Poll mode calls the explicit sync
//! endpoint on a fixed interval and never gives up on its own.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::api::ApiError;
use crate::model::{DeliveryBatch, ValueUpdate};
use crate::normalize::{normalize_frame, NormalizeError};
use crate::retry::ReconnectPolicy;
use crate::subscription::channel::{FrameSource, FrameStream, SyncSource};
use crate::subscription::sink::{ErrorHandler, UpdateSink};

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    Connecting,
    Open,
    Reconnecting,
    Failed,
    Stopped,
}

/// How a session receives values. Fixed for the lifetime of a session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Long-lived event stream with automatic reconnection.
    #[default]
    Push,
    /// Fixed-interval explicit sync calls.
    Poll,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SessionDefaults;

impl SessionDefaults {
    pub const POLL_INTERVAL: Duration = Duration::from_millis(1000);
}

#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub mode: DeliveryMode,
    pub reconnect: ReconnectPolicy,
    pub poll_interval: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            mode: DeliveryMode::Push,
            reconnect: ReconnectPolicy::default(),
            poll_interval: SessionDefaults::POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("stream channel closed by server")]
    ChannelClosed,

    #[error(transparent)]
    Parse(#[from] NormalizeError),

    #[error("subscription stream gave up after {attempts} reconnect attempts")]
    SubscriptionExhausted { attempts: u32 },
}

#[derive(Clone)]
enum Delivery {
    Push {
        source: Arc<dyn FrameSource>,
        policy: ReconnectPolicy,
    },
    Poll {
        source: Arc<dyn SyncSource>,
        interval: Duration,
    },
}

struct Shared {
    state: watch::Sender<SessionState>,
    attempts: AtomicU32,
}

/// Cancellation flag of one run.
///
/// Everything a run publishes (state, attempt counter, batches, errors) goes
/// through [`RunGate::publish`], so once [`RunGate::cancel`] returns the run
/// can no longer be observed.
#[derive(Default)]
struct RunGate {
    cancelled: Mutex<bool>,
}

impl RunGate {
    /// Blocks until an in-flight publish has finished.
    fn cancel(&self) {
        *self.cancelled.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }

    fn is_cancelled(&self) -> bool {
        *self.cancelled.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish<R>(&self, action: impl FnOnce() -> R) -> Option<R> {
        let cancelled = self.cancelled.lock().unwrap_or_else(PoisonError::into_inner);
        if *cancelled {
            return None;
        }
        Some(action())
    }
}

struct Run {
    task: JoinHandle<()>,
    gate: Arc<RunGate>,
}

impl Run {
    fn cancel(&self) {
        self.gate.cancel();
        self.task.abort();
    }
}

/// Owner of one subscription's delivery channel.
///
/// Batches reach the sink one at a time and in arrival order. `start` must be
/// called from within a tokio runtime.
pub struct LiveSession {
    delivery: Delivery,
    sink: Arc<dyn UpdateSink>,
    on_error: Arc<dyn ErrorHandler>,
    shared: Arc<Shared>,
    run: Option<Run>,
}

impl LiveSession {
    /// Creates an idle push-mode session.
    pub fn push(
        source: impl FrameSource,
        sink: impl UpdateSink,
        on_error: impl ErrorHandler,
        policy: ReconnectPolicy,
    ) -> Self {
        Self::with_delivery(
            Delivery::Push {
                source: Arc::new(source),
                policy,
            },
            Arc::new(sink),
            Arc::new(on_error),
        )
    }

    /// Creates an idle poll-mode session.
    pub fn poll(
        source: impl SyncSource,
        sink: impl UpdateSink,
        on_error: impl ErrorHandler,
        interval: Duration,
    ) -> Self {
        Self::with_delivery(
            Delivery::Poll {
                source: Arc::new(source),
                interval: interval.max(MIN_POLL_INTERVAL),
            },
            Arc::new(sink),
            Arc::new(on_error),
        )
    }

    fn with_delivery(
        delivery: Delivery,
        sink: Arc<dyn UpdateSink>,
        on_error: Arc<dyn ErrorHandler>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            delivery,
            sink,
            on_error,
            shared: Arc::new(Shared {
                state,
                attempts: AtomicU32::new(0),
            }),
            run: None,
        }
    }

    pub fn mode(&self) -> DeliveryMode {
        match self.delivery {
            Delivery::Push { .. } => DeliveryMode::Push,
            Delivery::Poll { .. } => DeliveryMode::Poll,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// Subscribes to state transitions.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Reconnects scheduled since the channel was last open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        let active = self
            .run
            .as_ref()
            .is_some_and(|run| !run.gate.is_cancelled());
        active
            && matches!(
                self.state(),
                SessionState::Connecting | SessionState::Open | SessionState::Reconnecting
            )
    }

    /// Enters `connecting` with a fresh attempt counter.
    ///
    /// Does nothing while a run is already connecting, open or reconnecting.
    /// From `idle`, `failed` or `stopped` a new run begins once the previous
    /// one has fully wound down.
    pub fn start(&mut self) {
        if self.is_running() {
            debug!(event = "session_start_ignored", state = ?self.state());
            return;
        }

        let previous = self.run.take().map(|run| {
            run.cancel();
            run.task
        });
        let gate = Arc::new(RunGate::default());
        self.shared.attempts.store(0, Ordering::SeqCst);
        self.shared.state.send_replace(SessionState::Connecting);
        info!(event = "session_started", mode = ?self.mode());

        let driver = Driver {
            shared: Arc::clone(&self.shared),
            gate: Arc::clone(&gate),
            sink: Arc::clone(&self.sink),
            on_error: Arc::clone(&self.on_error),
        };
        let delivery = self.delivery.clone();
        let task = tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            match delivery {
                Delivery::Push { source, policy } => driver.run_push(source, policy).await,
                Delivery::Poll { source, interval } => driver.run_poll(source, interval).await,
            }
        });

        self.run = Some(Run { task, gate });
    }

    /// Tears down the active channel or timer, including a pending reconnect.
    ///
    /// Waits for a sink or error-handler call already in progress, so the
    /// sink must not block on the session's owner. Nothing from the cancelled
    /// run is published after this returns.
    pub fn stop(&mut self) {
        if let Some(run) = self.run.as_ref() {
            run.cancel();
        }
        self.shared.attempts.store(0, Ordering::SeqCst);
        self.shared.state.send_replace(SessionState::Stopped);
        info!(event = "session_stopped");
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        if let Some(run) = self.run.take() {
            run.cancel();
        }
    }
}

/// Task-side half of one run.
struct Driver {
    shared: Arc<Shared>,
    gate: Arc<RunGate>,
    sink: Arc<dyn UpdateSink>,
    on_error: Arc<dyn ErrorHandler>,
}

impl Driver {
    async fn run_push(self, source: Arc<dyn FrameSource>, policy: ReconnectPolicy) {
        let mut attempt: u32 = 0;

        loop {
            match source.open().await {
                Ok(frames) => {
                    attempt = 0;
                    self.set_attempts(attempt);
                    if !self.transition(SessionState::Open) {
                        return;
                    }
                    let error = self.pump(frames).await;
                    warn!(event = "stream_channel_lost", error = %error);
                }
                Err(error) => {
                    warn!(event = "stream_connect_failed", attempt, error = %error);
                }
            }

            if policy.is_exhausted(attempt) {
                if self.transition(SessionState::Failed) {
                    warn!(event = "stream_reconnect_exhausted", attempts = attempt);
                    self.report(SessionError::SubscriptionExhausted { attempts: attempt });
                }
                return;
            }
            attempt += 1;
            self.set_attempts(attempt);

            if !self.transition(SessionState::Reconnecting) {
                return;
            }
            let delay = policy.delay_for_attempt(attempt);
            info!(
                event = "stream_reconnect_scheduled",
                attempt,
                delay_ms = delay.as_millis() as u64
            );
            tokio::time::sleep(delay).await;

            if !self.transition(SessionState::Connecting) {
                return;
            }
        }
    }

    /// Delivers frames until the channel fails; returns the reason.
    async fn pump(&self, mut frames: FrameStream) -> SessionError {
        while let Some(frame) = frames.next().await {
            match frame {
                Ok(text) => match normalize_frame(&text) {
                    Ok(updates) => self.deliver(updates),
                    Err(error) => {
                        let error = SessionError::Parse(error);
                        warn!(event = "stream_frame_dropped", error = %error);
                    }
                },
                Err(error) => return SessionError::Api(error),
            }
        }
        SessionError::ChannelClosed
    }

    async fn run_poll(self, source: Arc<dyn SyncSource>, interval: Duration) {
        if !self.transition(SessionState::Open) {
            return;
        }

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            match source.sync().await {
                Ok(updates) => self.deliver(updates),
                Err(error) => {
                    warn!(event = "poll_failed", error = %error);
                    self.report(SessionError::Api(error));
                }
            }
        }
    }

    fn transition(&self, next: SessionState) -> bool {
        let applied = self
            .gate
            .publish(|| self.shared.state.send_replace(next))
            .is_some();
        if applied {
            debug!(event = "session_transition", state = ?next);
        }
        applied
    }

    fn set_attempts(&self, attempts: u32) {
        self.gate
            .publish(|| self.shared.attempts.store(attempts, Ordering::SeqCst));
    }

    /// Hands the non-blank updates to the sink as one batch, if any remain.
    fn deliver(&self, updates: Vec<ValueUpdate>) {
        let updates = updates
            .into_iter()
            .filter(|update| !update.is_empty())
            .collect();
        let Some(batch) = DeliveryBatch::new(updates) else {
            debug!(event = "empty_batch_suppressed");
            return;
        };
        self.gate.publish(|| self.sink.deliver(batch));
    }

    fn report(&self, error: SessionError) {
        self.gate.publish(|| self.on_error.on_error(error));
    }
}
