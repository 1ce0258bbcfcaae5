use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::broadcast;
use tracing::debug;

use crate::analysis::analyze;
use crate::effects::EffectRecord;
use crate::error::SqlocalError;
use crate::identity::InstanceKey;
use crate::statement::Statement;

use super::subscription::Subscription;
use super::{DataCallback, ErrorCallback, QueryExecutor, SubscriptionHandle};

/// Live queries of one client, keyed by statement fingerprint.
pub(crate) struct ReactiveRegistry {
    origin: InstanceKey,
    enabled: bool,
    effects: broadcast::Sender<EffectRecord>,
    executor: Weak<dyn QueryExecutor>,
    subscriptions: Mutex<HashMap<String, Arc<Subscription>>>,
}

impl ReactiveRegistry {
    pub(crate) fn new(
        origin: InstanceKey,
        enabled: bool,
        effects: broadcast::Sender<EffectRecord>,
        executor: Weak<dyn QueryExecutor>,
    ) -> Self {
        Self {
            origin,
            enabled,
            effects,
            executor,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    fn subscriptions(&self) -> MutexGuard<'_, HashMap<String, Arc<Subscription>>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Validation happens before anything runs; the first subscriber starts the query.
    pub(crate) fn subscribe(
        self: &Arc<Self>,
        statement: &Statement,
        on_data: DataCallback,
        on_error: ErrorCallback,
    ) -> Result<SubscriptionHandle, SqlocalError> {
        if !self.enabled {
            return Err(SqlocalError::ReactiveContractError(
                "reactive queries are disabled for this client".into(),
            ));
        }

        let fingerprint = statement.fingerprint();
        let mut subscriptions = self.subscriptions();
        let (subscription, created) = match subscriptions.get(&fingerprint) {
            Some(existing) => (Arc::clone(existing), false),
            None => {
                let effects = analyze(statement.sql())?;
                if !effects.is_reactive_safe() {
                    return Err(SqlocalError::ReactiveContractError(format!(
                        "query must read at least one table and mutate none of them \
                         (reads {:?}, mutates {:?})",
                        effects.read_tables, effects.mutated_tables
                    )));
                }
                let subscription = Subscription::new(
                    statement.clone(),
                    effects.read_tables,
                    self.executor.clone(),
                );
                subscription.listen(self.effects.subscribe(), self.origin);
                subscriptions.insert(fingerprint.clone(), Arc::clone(&subscription));
                debug!(sql = statement.sql(), tables = ?subscription.read_tables(), "subscription created");
                (subscription, true)
            }
        };
        let (id, cached) = subscription.attach(Arc::clone(&on_data), on_error);
        drop(subscriptions);

        if created {
            subscription.schedule();
        } else if let Some(result) = cached {
            on_data(&result);
        }
        Ok(SubscriptionHandle {
            registry: Arc::downgrade(self),
            fingerprint,
            id,
            active: true,
        })
    }

    pub(crate) fn unsubscribe(&self, fingerprint: &str, id: u64) {
        let mut subscriptions = self.subscriptions();
        let emptied = subscriptions
            .get(fingerprint)
            .is_some_and(|subscription| subscription.detach(id));
        if emptied && let Some(subscription) = subscriptions.remove(fingerprint) {
            subscription.close();
            debug!(fingerprint, "subscription closed");
        }
    }

    /// Schedule every subscription whose read set the record touches.
    pub(crate) fn notify(&self, record: &EffectRecord) {
        for subscription in self.snapshot() {
            if record.affects(subscription.read_tables()) {
                subscription.schedule();
            }
        }
    }

    pub(crate) fn rerun_all(&self) {
        for subscription in self.snapshot() {
            subscription.schedule();
        }
    }

    pub(crate) fn shutdown(&self) {
        for (_, subscription) in self.subscriptions().drain() {
            subscription.close();
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.subscriptions().len()
    }

    fn snapshot(&self) -> Vec<Arc<Subscription>> {
        self.subscriptions().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactive::subscription::Phase;
    use crate::results::ResultSet;
    use crate::types::RowValues;
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    /// Executor returning a counter, optionally held until permits are added.
    struct Counter {
        value: AtomicI64,
        runs: AtomicUsize,
        permits: Semaphore,
    }

    impl Counter {
        fn new(open: bool) -> Arc<Self> {
            Arc::new(Self {
                value: AtomicI64::new(0),
                runs: AtomicUsize::new(0),
                permits: Semaphore::new(if open { Semaphore::MAX_PERMITS } else { 0 }),
            })
        }
    }

    #[async_trait]
    impl QueryExecutor for Counter {
        async fn run_query(&self, _statement: &Statement) -> Result<ResultSet, SqlocalError> {
            let permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| SqlocalError::ConnectionError("closed".into()))?;
            permit.forget();
            self.runs.fetch_add(1, Ordering::SeqCst);
            let value = self.value.load(Ordering::SeqCst);
            if value < 0 {
                return Err(SqlocalError::DriverMessage("negative".into()));
            }
            let mut result = ResultSet::with_columns(vec!["n".into()]);
            result.add_row_values(vec![RowValues::Int(value)]);
            Ok(result)
        }
    }

    fn registry(executor: &Arc<Counter>) -> Arc<ReactiveRegistry> {
        let (effects, _) = broadcast::channel(16);
        let weak = Arc::downgrade(executor);
        let executor: Weak<dyn QueryExecutor> = weak;
        Arc::new(ReactiveRegistry::new(
            InstanceKey::new(),
            true,
            effects,
            executor,
        ))
    }

    fn record(tables: &[&str]) -> EffectRecord {
        EffectRecord {
            origin: InstanceKey::new(),
            mutated_tables: tables.iter().map(|t| (*t).to_owned()).collect(),
            database_replaced: false,
        }
    }

    type Seen = Arc<Mutex<Vec<i64>>>;

    fn collect(seen: &Seen) -> DataCallback {
        let seen = Arc::clone(seen);
        Arc::new(move |result: &ResultSet| {
            if let Some(RowValues::Int(n)) = result.scalar() {
                seen.lock().unwrap().push(*n);
            }
        })
    }

    fn ignore_errors() -> ErrorCallback {
        Arc::new(|_: &SqlocalError| {})
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn effects_in_flight_coalesce_into_one_rerun() {
        let executor = Counter::new(false);
        let registry = registry(&executor);
        let seen: Seen = Arc::default();
        let _handle = registry
            .subscribe(&Statement::new("SELECT count(*) FROM todos"), collect(&seen), ignore_errors())
            .unwrap();

        // Initial run is parked on the semaphore; these all land while it is in flight.
        executor.value.store(3, Ordering::SeqCst);
        for _ in 0..3 {
            registry.notify(&record(&["todos"]));
        }
        executor.permits.add_permits(Semaphore::MAX_PERMITS / 2);
        settle().await;

        assert_eq!(executor.runs.load(Ordering::SeqCst), 2);
        assert_eq!(*seen.lock().unwrap(), vec![3]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unrelated_tables_do_not_rerun() {
        let executor = Counter::new(true);
        let registry = registry(&executor);
        let seen: Seen = Arc::default();
        let _handle = registry
            .subscribe(&Statement::new("SELECT count(*) FROM todos"), collect(&seen), ignore_errors())
            .unwrap();
        settle().await;
        registry.notify(&record(&["groceries"]));
        settle().await;
        assert_eq!(executor.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn subscribers_share_one_execution() {
        let executor = Counter::new(true);
        let registry = registry(&executor);
        let first: Seen = Arc::default();
        let second: Seen = Arc::default();
        let statement = Statement::new("SELECT count(*) FROM todos");

        let _a = registry.subscribe(&statement, collect(&first), ignore_errors()).unwrap();
        settle().await;
        let _b = registry.subscribe(&statement, collect(&second), ignore_errors()).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(*second.lock().unwrap(), vec![0]);

        executor.value.store(1, Ordering::SeqCst);
        registry.notify(&record(&["todos"]));
        settle().await;
        assert_eq!(executor.runs.load(Ordering::SeqCst), 2);
        assert_eq!(*first.lock().unwrap(), vec![0, 1]);
        assert_eq!(*second.lock().unwrap(), vec![0, 1]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn errors_keep_the_subscription_alive() {
        let executor = Counter::new(true);
        let registry = registry(&executor);
        let seen: Seen = Arc::default();
        let errors = Arc::new(AtomicUsize::new(0));
        let on_error: ErrorCallback = {
            let errors = Arc::clone(&errors);
            Arc::new(move |_: &SqlocalError| {
                errors.fetch_add(1, Ordering::SeqCst);
            })
        };
        let _handle = registry
            .subscribe(&Statement::new("SELECT count(*) FROM todos"), collect(&seen), on_error)
            .unwrap();
        settle().await;

        executor.value.store(-1, Ordering::SeqCst);
        registry.notify(&record(&["todos"]));
        settle().await;
        assert_eq!(errors.load(Ordering::SeqCst), 1);

        // Same value as before the failure is still delivered.
        executor.value.store(0, Ordering::SeqCst);
        registry.notify(&record(&["todos"]));
        settle().await;
        assert_eq!(*seen.lock().unwrap(), vec![0, 0]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn last_unsubscribe_tears_down() {
        let executor = Counter::new(true);
        let registry = registry(&executor);
        let statement = Statement::new("SELECT count(*) FROM todos");
        let handle = registry
            .subscribe(&statement, Arc::new(|_: &ResultSet| {}), ignore_errors())
            .unwrap();
        settle().await;
        handle.unsubscribe();
        assert_eq!(registry.len(), 0);

        registry.notify(&record(&["todos"]));
        settle().await;
        assert_eq!(executor.runs.load(Ordering::SeqCst), 1);

        let _again = registry
            .subscribe(&statement, Arc::new(|_: &ResultSet| {}), ignore_errors())
            .unwrap();
        settle().await;
        assert_eq!(executor.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unsafe_queries_are_rejected_before_running() {
        let executor = Counter::new(true);
        let registry = registry(&executor);
        for sql in [
            "SELECT 1",
            "UPDATE t SET x = (SELECT max(x) FROM t)",
            "INSERT INTO log SELECT * FROM log",
        ] {
            let err = registry
                .subscribe(&Statement::new(sql), Arc::new(|_: &ResultSet| {}), ignore_errors())
                .unwrap_err();
            assert!(matches!(err, SqlocalError::ReactiveContractError(_)), "{sql}");
        }
        let parse = registry
            .subscribe(&Statement::new("SELEC nope"), Arc::new(|_: &ResultSet| {}), ignore_errors())
            .unwrap_err();
        assert!(matches!(parse, SqlocalError::ParseError(_)));
        settle().await;
        assert_eq!(executor.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn remote_effects_arrive_through_the_broadcast() {
        let executor = Counter::new(true);
        let registry = registry(&executor);
        let statement = Statement::new("SELECT count(*) FROM todos");
        let handle = registry
            .subscribe(&statement, Arc::new(|_: &ResultSet| {}), ignore_errors())
            .unwrap();
        settle().await;

        registry.effects.send(record(&["todos"])).unwrap();
        settle().await;
        assert_eq!(executor.runs.load(Ordering::SeqCst), 2);

        let own = EffectRecord {
            origin: registry.origin,
            mutated_tables: BTreeSet::from(["todos".to_owned()]),
            database_replaced: false,
        };
        registry.effects.send(own).unwrap();
        settle().await;
        assert_eq!(executor.runs.load(Ordering::SeqCst), 2);

        let fingerprint = statement.fingerprint();
        let phase = registry.subscriptions().get(&fingerprint).map(|s| s.phase());
        assert_eq!(phase, Some(Phase::Idle));
        drop(handle);
        assert_eq!(registry.len(), 0);
    }
}
