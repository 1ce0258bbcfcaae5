//! Convenient imports for common functionality.

pub use crate::analysis::{QueryEffects, analyze};
pub use crate::client::{
    ClientBuilder, ClientConfig, ConnectReason, SqlClient, Transaction, TransactionScope,
};
pub use crate::driver::{DatabaseExport, StorageTarget, StorageType};
pub use crate::effects::EffectSource;
pub use crate::error::SqlocalError;
pub use crate::host::Host;
pub use crate::lock::LockGuarantees;
pub use crate::processor::DatabaseInfo;
pub use crate::reactive::{ReactiveQuery, SubscriptionHandle};
pub use crate::results::{CustomDbRow, ResultSet};
pub use crate::sql;
pub use crate::statement::{SqlArg, Statement};
pub use crate::types::RowValues;
