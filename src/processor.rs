//! The execution processor: a dedicated thread that owns one database handle.
//!
//! Requests arrive as [`InputMessage`]s and are executed strictly one at a time. While a
//! transaction is open every message that does not belong to it is queued and replayed in
//! arrival order afterwards. Responses go out as [`OutputMessage`]s keyed by the request's
//! [`QueryKey`].

mod dispatcher;
mod manager;
mod messages;

pub use manager::ProcessorHandle;
pub use messages::{
    DatabaseInfo, FunctionKind, InputMessage, OutputMessage, ProcessorConfig, QueryKey,
};
