use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, MutexGuard, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::error::SqlocalError;
use crate::host::Host;
use crate::identity::{DatabaseIdentity, InstanceKey};
use crate::processor::{InputMessage, QueryKey};

use super::{LockGuarantees, LockManager, LockSignal, LockToken};

/// How often a waiting context repeats its "lock requested" signal.
const REQUEST_RETRY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Access {
    Read,
    Mutate,
    /// Replaces or reopens the database; callers keep the permit until the work is done.
    Disruptive,
}

/// Ordering and locking state held for one call.
///
/// The gate keeps calls of one client in order; it is released once the request is on the
/// wire. The lock token lives until the caller drops the permit.
pub(crate) struct CallPermit<'a> {
    gate: Option<MutexGuard<'a, ()>>,
    held: Option<MutexGuard<'a, Option<LockToken>>>,
    lock: Option<LockToken>,
}

impl CallPermit<'_> {
    /// Let later calls of this client proceed.
    pub(crate) fn release_order(&mut self) {
        self.held = None;
        self.gate = None;
    }

    pub(crate) fn take_lock(&mut self) -> Option<LockToken> {
        self.lock.take()
    }
}

/// Per-client side of the mutation lock protocol.
pub(crate) struct MutationCoordinator {
    identity: DatabaseIdentity,
    instance: InstanceKey,
    host: Arc<Host>,
    channel: Arc<Channel>,
    exclusive: bool,
    gate: Mutex<()>,
    held: Arc<Mutex<Option<LockToken>>>,
    suspended: Arc<AtomicBool>,
    warned: AtomicBool,
    signals: broadcast::Sender<LockSignal>,
    cancel: CancellationToken,
}

impl MutationCoordinator {
    /// Must be called inside a tokio runtime when `exclusive` is set.
    pub(crate) fn new(
        identity: DatabaseIdentity,
        instance: InstanceKey,
        host: Arc<Host>,
        channel: Arc<Channel>,
        exclusive: bool,
    ) -> Self {
        let signals = host.lock_signals(&identity);
        let held = Arc::new(Mutex::new(None));
        let suspended = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        if exclusive {
            tokio::spawn(release_on_request(
                Arc::clone(&held),
                Arc::clone(&channel),
                Arc::clone(&suspended),
                signals.subscribe(),
                instance,
                cancel.clone(),
            ));
        }

        Self {
            identity,
            instance,
            host,
            channel,
            exclusive,
            gate: Mutex::new(()),
            held,
            suspended,
            warned: AtomicBool::new(false),
            signals,
            cancel,
        }
    }

    #[must_use]
    pub(crate) fn guarantees(&self) -> LockGuarantees {
        if self.host.has_lock_facility() {
            LockGuarantees::Coordinated
        } else {
            LockGuarantees::Degraded
        }
    }

    /// Take the resource up front for backends that need it before opening the handle.
    pub(crate) async fn connect(&self) -> Result<(), SqlocalError> {
        if self.exclusive {
            let _held = self.ensure_held().await?;
        }
        Ok(())
    }

    /// Wait for this client's turn and, for mutations, the identity's lock.
    pub(crate) async fn enter(&self, access: Access) -> Result<CallPermit<'_>, SqlocalError> {
        let gate = self.gate.lock().await;
        let mut permit = CallPermit {
            gate: Some(gate),
            held: None,
            lock: None,
        };
        if self.exclusive {
            permit.held = Some(self.ensure_held().await?);
        } else if access != Access::Read {
            permit.lock = self.acquire_scoped().await;
        }
        Ok(permit)
    }

    /// Give up every hold; used when the client is destroyed.
    pub(crate) async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(token) = self.held.lock().await.take() {
            token.release();
        }
    }

    async fn acquire_scoped(&self) -> Option<LockToken> {
        match self.host.locks() {
            Some(manager) => Some(manager.acquire(&self.identity, self.instance).await),
            None => {
                self.warn_degraded();
                None
            }
        }
    }

    async fn ensure_held(&self) -> Result<MutexGuard<'_, Option<LockToken>>, SqlocalError> {
        let mut held = self.held.lock().await;
        if held.is_none() {
            match self.host.locks() {
                Some(manager) => *held = Some(self.request_exclusive(manager).await),
                None => self.warn_degraded(),
            }
            if self.suspended.swap(false, Ordering::SeqCst) {
                debug!(identity = %self.identity, "reopening handle after hand-off");
                let reopened = self
                    .channel
                    .request(InputMessage::Reinit {
                        key: QueryKey::new(),
                    })
                    .await
                    .and_then(|response| response.into_unit());
                if let Err(err) = reopened {
                    self.suspended.store(true, Ordering::SeqCst);
                    return Err(err);
                }
            }
        }
        Ok(held)
    }

    /// Signal current holders, then wait in line. The signal is repeated while waiting so a
    /// context that took the lock after the first signal still hands it over.
    async fn request_exclusive(&self, manager: &LockManager) -> LockToken {
        let acquire = manager.acquire(&self.identity, self.instance);
        tokio::pin!(acquire);
        loop {
            let _ = self.signals.send(LockSignal {
                origin: self.instance,
            });
            match tokio::time::timeout(REQUEST_RETRY, &mut acquire).await {
                Ok(token) => return token,
                Err(_) => debug!(identity = %self.identity, "still waiting for exclusive resource"),
            }
        }
    }

    fn warn_degraded(&self) {
        if !self.warned.swap(true, Ordering::SeqCst) {
            warn!(
                identity = %self.identity,
                "no lock facility in host; writes are not coordinated across contexts"
            );
        }
    }
}

impl Drop for MutationCoordinator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn release_on_request(
    held: Arc<Mutex<Option<LockToken>>>,
    channel: Arc<Channel>,
    suspended: Arc<AtomicBool>,
    mut signals: broadcast::Receiver<LockSignal>,
    instance: InstanceKey,
    cancel: CancellationToken,
) {
    loop {
        let signal = tokio::select! {
            () = cancel.cancelled() => break,
            signal = signals.recv() => signal,
        };
        match signal {
            Ok(signal) if signal.origin == instance => continue,
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => break,
        }

        let mut held = held.lock().await;
        let Some(token) = held.take() else {
            continue;
        };
        // The processor answers only after in-flight work, including an open transaction.
        let suspend = channel
            .request(InputMessage::Suspend {
                key: QueryKey::new(),
            })
            .await;
        if let Err(err) = suspend {
            warn!(error = %err, "suspend before hand-off failed");
        }
        suspended.store(true, Ordering::SeqCst);
        info!(identity = %token.identity(), "exclusive resource handed to a peer");
        token.release();
    }
}
