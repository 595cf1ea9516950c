//! Session-scoped activity subscription.
//!
//! One consumer task per subscription owns the [`ActivityState`], drains the
//! transport's frames in arrival order and publishes a fresh snapshot after
//! every accepted transition. Teardown bumps a generation counter under the
//! same lock publication takes, so once `subscribe`/`unsubscribe`/drop
//! returns, nothing from the old subscription can reach watchers.

use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use pulse_core::events::ActivityEvent;
use pulse_core::ids::SessionId;
use pulse_core::settings::StreamSettings;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::backoff::ReconnectPolicy;
use crate::state::{ActivityState, ConnectionSignal, Outcome, DEFAULT_RETENTION_CAP};
use crate::transport::Transport;

#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// Max retained events (and thinking events).
    pub retention_cap: usize,
    pub reconnect: ReconnectPolicy,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            retention_cap: DEFAULT_RETENTION_CAP,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl From<&StreamSettings> for StreamConfig {
    fn from(settings: &StreamSettings) -> Self {
        Self {
            retention_cap: settings.retention_cap,
            reconnect: ReconnectPolicy::from(&settings.reconnect),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("subscribing to a session requires a running tokio runtime")]
    NoRuntime,
}

/// Read side of a client's state. Cheap to clone; every clone sees the
/// same snapshots.
#[derive(Clone, Debug)]
pub struct ActivityWatch {
    rx: watch::Receiver<Arc<ActivityState>>,
}

impl ActivityWatch {
    pub fn snapshot(&self) -> Arc<ActivityState> {
        Arc::clone(&*self.rx.borrow())
    }

    pub fn is_connected(&self) -> bool {
        self.rx.borrow().is_connected()
    }

    /// Wait for the next published snapshot. Returns false once the client
    /// and its task are gone.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }

    /// Wait until a snapshot satisfies `pred` (checked against the current
    /// one first).
    pub async fn wait_for(
        &mut self,
        mut pred: impl FnMut(&ActivityState) -> bool,
    ) -> Option<Arc<ActivityState>> {
        let snapshot = self.rx.wait_for(|state| pred(state.as_ref())).await.ok()?;
        Some(Arc::clone(&*snapshot))
    }
}

/// Snapshot channel plus the generation that may write to it.
struct Publisher {
    generation: Mutex<u64>,
    tx: watch::Sender<Arc<ActivityState>>,
}

impl Publisher {
    fn new(retention_cap: usize) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(ActivityState::new(retention_cap)));
        Self {
            generation: Mutex::new(0),
            tx,
        }
    }

    /// Publish unless `generation` has been retired.
    fn publish(&self, generation: u64, state: &ActivityState) -> bool {
        let current = self.generation.lock();
        if *current != generation {
            return false;
        }
        self.tx.send_replace(Arc::new(state.clone()));
        true
    }

    /// Retire the current generation and publish an empty state.
    fn reset(&self, retention_cap: usize) -> u64 {
        let mut current = self.generation.lock();
        *current += 1;
        self.tx
            .send_replace(Arc::new(ActivityState::new(retention_cap)));
        *current
    }

    fn watch(&self) -> ActivityWatch {
        ActivityWatch {
            rx: self.tx.subscribe(),
        }
    }
}

struct Subscription {
    session_id: SessionId,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Live activity for at most one session at a time.
pub struct ActivityStreamClient<T: Transport> {
    transport: Arc<T>,
    config: StreamConfig,
    publisher: Arc<Publisher>,
    active: Option<Subscription>,
}

impl<T: Transport> ActivityStreamClient<T> {
    pub fn new(transport: Arc<T>, config: StreamConfig) -> Self {
        let publisher = Arc::new(Publisher::new(config.retention_cap));
        Self {
            transport,
            config,
            publisher,
            active: None,
        }
    }

    pub fn watch(&self) -> ActivityWatch {
        self.publisher.watch()
    }

    pub fn snapshot(&self) -> Arc<ActivityState> {
        Arc::clone(&*self.publisher.tx.borrow())
    }

    /// Session currently subscribed, if any.
    pub fn session_id(&self) -> Option<&SessionId> {
        self.active.as_ref().map(|sub| &sub.session_id)
    }

    /// Follow `session_id`, or nothing for `None`.
    ///
    /// The same session again is a no-op while its task is still running.
    /// A different session, or one whose task gave up reconnecting, tears
    /// the old subscription down and resets state before the new connection
    /// is attempted.
    pub fn subscribe(
        &mut self,
        session_id: Option<SessionId>,
    ) -> Result<ActivityWatch, StreamError> {
        let Some(session_id) = session_id else {
            self.teardown();
            return Ok(self.watch());
        };
        if self
            .active
            .as_ref()
            .is_some_and(|sub| sub.session_id == session_id && !sub.task.is_finished())
        {
            return Ok(self.watch());
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| StreamError::NoRuntime)?;
        let generation = self.teardown();
        let cancel = CancellationToken::new();

        let span = info_span!("activity_stream", session_id = %session_id);
        let task = runtime.spawn(
            run_subscription(
                Arc::clone(&self.transport),
                session_id.clone(),
                self.config.clone(),
                Arc::clone(&self.publisher),
                generation,
                cancel.clone(),
            )
            .instrument(span),
        );
        info!(session_id = %session_id, "subscribed to activity stream");

        self.active = Some(Subscription {
            session_id,
            cancel,
            task,
        });
        Ok(self.watch())
    }

    pub fn unsubscribe(&mut self) {
        self.teardown();
    }

    fn teardown(&mut self) -> u64 {
        if let Some(sub) = self.active.take() {
            sub.cancel.cancel();
            sub.task.abort();
            debug!(session_id = %sub.session_id, "activity subscription torn down");
        }
        self.publisher.reset(self.config.retention_cap)
    }
}

impl<T: Transport> Drop for ActivityStreamClient<T> {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Consumer task: connect, fold frames, reconnect with backoff, until
/// cancelled or the policy gives up.
async fn run_subscription<T: Transport>(
    transport: Arc<T>,
    session_id: SessionId,
    config: StreamConfig,
    publisher: Arc<Publisher>,
    generation: u64,
    cancel: CancellationToken,
) {
    let mut state = ActivityState::new(config.retention_cap);
    let policy = config.reconnect;
    let mut failures: u32 = 0;

    loop {
        let connected = tokio::select! {
            _ = cancel.cancelled() => return,
            result = transport.connect(&session_id) => result,
        };

        match connected {
            Ok(mut frames) => {
                info!("activity stream connected");
                let connected_at = Instant::now();
                let mut delivered = false;
                if !fold_signal(&mut state, ConnectionSignal::Connected, &publisher, generation) {
                    return;
                }

                loop {
                    let next = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        next = frames.next() => next,
                    };
                    match next {
                        Some(Ok(text)) => {
                            let event = match ActivityEvent::from_frame(&text) {
                                Ok(event) => event,
                                Err(err) => {
                                    warn!(
                                        reason = err.error_kind(),
                                        error = %err,
                                        "dropping activity frame"
                                    );
                                    continue;
                                }
                            };
                            delivered = true;
                            let agent_id = event.agent_id.clone();
                            match state.apply(event) {
                                Outcome::Applied => {
                                    if !publisher.publish(generation, &state) {
                                        return;
                                    }
                                }
                                Outcome::Duplicate => {
                                    debug!(
                                        agent_id = %agent_id,
                                        "duplicate activity frame ignored"
                                    );
                                }
                                Outcome::Ignored => {}
                            }
                        }
                        Some(Err(err)) => {
                            warn!(reason = err.error_kind(), error = %err, "activity stream lost");
                            break;
                        }
                        None => {
                            info!("activity stream ended");
                            break;
                        }
                    }
                }

                if !fold_signal(
                    &mut state,
                    ConnectionSignal::Disconnected,
                    &publisher,
                    generation,
                ) {
                    return;
                }
                // A socket that closes before proving itself counts as a failure.
                if delivered || connected_at.elapsed() >= policy.initial_delay {
                    failures = 0;
                } else {
                    debug!(failures = failures + 1, "activity stream closed before any frame");
                }
            }
            Err(err) => {
                warn!(
                    reason = err.error_kind(),
                    error = %err,
                    failures = failures + 1,
                    "activity stream connect failed"
                );
            }
        }

        if !policy.allows(failures) {
            warn!(failures, "giving up on activity stream");
            return;
        }
        let delay = policy.delay_for(failures);
        failures = failures.saturating_add(1);
        debug!(delay_ms = delay.as_millis() as u64, attempt = failures, "reconnecting");

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Returns false when this subscription's generation has been retired.
fn fold_signal(
    state: &mut ActivityState,
    signal: ConnectionSignal,
    publisher: &Publisher,
    generation: u64,
) -> bool {
    if state.apply_signal(signal).changed() {
        return publisher.publish(generation, state);
    }
    true
}
