use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::effects::EffectRecord;
use crate::error::{SqlocalError, connection_error};
use crate::identity::InstanceKey;
use crate::results::ResultSet;
use crate::statement::Statement;

use super::{DataCallback, ErrorCallback, QueryExecutor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Idle,
    Running,
    ErrorIdle,
}

struct Subscriber {
    id: u64,
    on_data: DataCallback,
    on_error: ErrorCallback,
    /// Has received the current `last_result`.
    seen_latest: bool,
}

struct SubscriptionState {
    phase: Phase,
    pending_rerun: bool,
    last_result: Option<ResultSet>,
    subscribers: Vec<Subscriber>,
    next_id: u64,
}

/// One live query shared by every subscriber of the same statement.
pub(crate) struct Subscription {
    statement: Statement,
    read_tables: BTreeSet<String>,
    executor: Weak<dyn QueryExecutor>,
    state: Mutex<SubscriptionState>,
    cancel: CancellationToken,
}

impl Subscription {
    pub(crate) fn new(
        statement: Statement,
        read_tables: BTreeSet<String>,
        executor: Weak<dyn QueryExecutor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            statement,
            read_tables,
            executor,
            state: Mutex::new(SubscriptionState {
                phase: Phase::Idle,
                pending_rerun: false,
                last_result: None,
                subscribers: Vec::new(),
                next_id: 0,
            }),
            cancel: CancellationToken::new(),
        })
    }

    pub(crate) fn read_tables(&self) -> &BTreeSet<String> {
        &self.read_tables
    }

    #[cfg(test)]
    pub(crate) fn phase(&self) -> Phase {
        self.state().phase
    }

    fn state(&self) -> MutexGuard<'_, SubscriptionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a subscriber. Returns its id and the cached result it should see right away.
    pub(crate) fn attach(
        self: &Arc<Self>,
        on_data: DataCallback,
        on_error: ErrorCallback,
    ) -> (u64, Option<ResultSet>) {
        let mut state = self.state();
        let id = state.next_id;
        state.next_id += 1;

        let cached = if state.phase == Phase::Running {
            None
        } else {
            state.last_result.clone()
        };
        state.subscribers.push(Subscriber {
            id,
            on_data,
            on_error,
            seen_latest: cached.is_some(),
        });
        let rerun = state.phase == Phase::ErrorIdle;
        drop(state);

        if rerun {
            self.schedule();
        }
        (id, cached)
    }

    /// Remove a subscriber; returns `true` when none are left.
    pub(crate) fn detach(&self, id: u64) -> bool {
        let mut state = self.state();
        state.subscribers.retain(|subscriber| subscriber.id != id);
        state.subscribers.is_empty()
    }

    /// Tear down the listener and stop further re-runs.
    pub(crate) fn close(&self) {
        self.cancel.cancel();
    }

    /// Run the query now, or once more after the run in flight.
    pub(crate) fn schedule(self: &Arc<Self>) {
        if self.cancel.is_cancelled() {
            return;
        }
        let mut state = self.state();
        if state.phase == Phase::Running {
            state.pending_rerun = true;
            return;
        }
        state.phase = Phase::Running;
        drop(state);
        tokio::spawn(Arc::clone(self).run());
    }

    async fn run(self: Arc<Self>) {
        loop {
            if self.cancel.is_cancelled() {
                self.state().phase = Phase::Idle;
                return;
            }
            let outcome = match self.executor.upgrade() {
                Some(executor) => executor.run_query(&self.statement).await,
                None => Err(connection_error("client dropped")),
            };
            let failed = self.deliver(outcome);

            let mut state = self.state();
            if state.pending_rerun {
                state.pending_rerun = false;
                continue;
            }
            state.phase = if failed {
                Phase::ErrorIdle
            } else {
                Phase::Idle
            };
            return;
        }
    }

    /// Hand a result to every subscriber that has not seen it. Returns `true` on failure.
    fn deliver(&self, outcome: Result<ResultSet, SqlocalError>) -> bool {
        let mut data_calls = Vec::new();
        let mut error_calls = Vec::new();
        {
            let mut guard = self.state();
            let state = &mut *guard;
            match &outcome {
                Ok(result) => {
                    let changed = state.last_result.as_ref() != Some(result);
                    for subscriber in &mut state.subscribers {
                        if changed || !subscriber.seen_latest {
                            data_calls.push(Arc::clone(&subscriber.on_data));
                            subscriber.seen_latest = true;
                        }
                    }
                    state.last_result = Some(result.clone());
                }
                Err(_) => {
                    for subscriber in &mut state.subscribers {
                        error_calls.push(Arc::clone(&subscriber.on_error));
                        subscriber.seen_latest = false;
                    }
                    state.last_result = None;
                }
            }
        }

        match outcome {
            Ok(result) => {
                debug!(sql = self.statement.sql(), notified = data_calls.len(), "query re-run delivered");
                for on_data in data_calls {
                    on_data(&result);
                }
                false
            }
            Err(err) => {
                debug!(sql = self.statement.sql(), error = %err, "query re-run failed");
                for on_error in error_calls {
                    on_error(&err);
                }
                true
            }
        }
    }

    /// Follow effects published by other contexts until the subscription is closed.
    pub(crate) fn listen(
        self: &Arc<Self>,
        mut effects: broadcast::Receiver<EffectRecord>,
        origin: InstanceKey,
    ) {
        let subscription = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    () = cancel.cancelled() => break,
                    received = effects.recv() => received,
                };
                let Some(subscription) = subscription.upgrade() else {
                    break;
                };
                match received {
                    // Local effects arrive through the registry; replacements through the client.
                    Ok(record) if record.origin == origin || record.database_replaced => {}
                    Ok(record) => {
                        if record.affects(subscription.read_tables()) {
                            subscription.schedule();
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "effect listener lagged; re-running query");
                        subscription.schedule();
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }
}
