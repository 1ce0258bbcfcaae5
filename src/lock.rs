//! Exclusive write locks scoped to a [`DatabaseIdentity`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::identity::{DatabaseIdentity, InstanceKey};

mod coordinator;

pub(crate) use coordinator::{Access, MutationCoordinator};

/// What the lock layer can promise for a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockGuarantees {
    /// Writes are serialized across every context sharing the host.
    Coordinated,
    /// No lock facility: writes are only serialized within one client.
    Degraded,
}

/// Broadcast by a context right before it waits for an exclusive resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockSignal {
    pub origin: InstanceKey,
}

/// In-process lock facility. Waiters are served first come, first served.
#[derive(Default)]
pub struct LockManager {
    locks: Mutex<HashMap<DatabaseIdentity, Arc<AsyncMutex<()>>>>,
}

impl LockManager {
    /// Wait until the lock for `identity` is free and take it. Never times out.
    pub async fn acquire(&self, identity: &DatabaseIdentity, holder: InstanceKey) -> LockToken {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(identity.clone()).or_default())
        };
        let guard = lock.lock_owned().await;
        debug!(%identity, %holder, "lock acquired");
        LockToken {
            identity: identity.clone(),
            holder,
            _guard: guard,
        }
    }
}

/// Proof of sole write ownership. Dropping the token releases the lock.
pub struct LockToken {
    identity: DatabaseIdentity,
    holder: InstanceKey,
    _guard: OwnedMutexGuard<()>,
}

impl LockToken {
    #[must_use]
    pub fn identity(&self) -> &DatabaseIdentity {
        &self.identity
    }

    pub fn release(self) {
        drop(self);
    }
}

impl Drop for LockToken {
    fn drop(&mut self) {
        debug!(identity = %self.identity, holder = %self.holder, "lock released");
    }
}

impl fmt::Debug for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockToken")
            .field("identity", &self.identity)
            .field("holder", &self.holder)
            .finish_non_exhaustive()
    }
}
