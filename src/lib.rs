//! Shared SQLite access for many in-process contexts.
//!
//! Each [`SqlClient`] drives its own processor thread that owns the database handle.
//! Clients built on one [`Host`] coordinate through it: writes to the same database take a
//! per-database lock, and every committed write is published as an effect so
//! [`ReactiveQuery`] subscribers in any client re-run when tables they read change.

pub mod analysis;
pub mod client;
pub mod driver;
pub mod effects;
pub mod error;
pub mod host;
pub mod identity;
pub mod lock;
pub mod prelude;
pub mod processor;
pub mod reactive;
pub mod results;
pub mod statement;
pub mod types;

mod channel;

pub use channel::CallbackHandler;
pub use client::{
    ClientBuilder, ClientConfig, ConnectReason, SqlClient, Transaction, TransactionScope,
};
pub use error::SqlocalError;
pub use host::Host;
pub use lock::LockGuarantees;
pub use reactive::{ReactiveQuery, SubscriptionHandle};
