//! The environment shared by every execution context of one origin.
//!
//! A [`Host`] owns the optional lock facility and the per-identity broadcast channels.
//! Clients that are built with the same `Arc<Host>` coordinate with each other; clients on
//! different hosts never see each other's locks or effects.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast;

use crate::effects::EffectRecord;
use crate::identity::DatabaseIdentity;
use crate::lock::{LockManager, LockSignal};

const BROADCAST_CAPACITY: usize = 256;

#[derive(Clone)]
struct IdentityChannels {
    lock_signals: broadcast::Sender<LockSignal>,
    effects: broadcast::Sender<EffectRecord>,
}

impl IdentityChannels {
    fn new() -> Self {
        let (lock_signals, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (effects, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            lock_signals,
            effects,
        }
    }
}

pub struct Host {
    locks: Option<LockManager>,
    channels: Mutex<HashMap<DatabaseIdentity, IdentityChannels>>,
}

impl Host {
    /// Host with a lock facility.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            locks: Some(LockManager::default()),
            channels: Mutex::new(HashMap::new()),
        })
    }

    /// Host without a lock facility; clients fall back to uncoordinated execution.
    #[must_use]
    pub fn without_locks() -> Arc<Self> {
        Arc::new(Self {
            locks: None,
            channels: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn has_lock_facility(&self) -> bool {
        self.locks.is_some()
    }

    pub(crate) fn locks(&self) -> Option<&LockManager> {
        self.locks.as_ref()
    }

    pub(crate) fn lock_signals(&self, identity: &DatabaseIdentity) -> broadcast::Sender<LockSignal> {
        self.channels_for(identity).lock_signals
    }

    pub(crate) fn effects(&self, identity: &DatabaseIdentity) -> broadcast::Sender<EffectRecord> {
        self.channels_for(identity).effects
    }

    fn channels_for(&self, identity: &DatabaseIdentity) -> IdentityChannels {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(identity.clone())
            .or_insert_with(IdentityChannels::new)
            .clone()
    }
}
