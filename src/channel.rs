//! Request/response correlation between a client and its processor.
//!
//! Every request registers a oneshot responder under its [`QueryKey`] before it is sent; a
//! router task reads the processor's output stream and completes the matching responder.
//! Callback invocations carry no key and are dispatched to handlers by function name.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::driver::DatabaseExport;
use crate::error::{SqlocalError, connection_error, protocol_error};
use crate::processor::{DatabaseInfo, InputMessage, OutputMessage, ProcessorHandle, QueryKey};
use crate::results::ResultSet;
use crate::types::RowValues;

/// Handler for a callback function registered with the processor.
pub type CallbackHandler = Arc<dyn Fn(Vec<RowValues>) + Send + Sync>;

type Pending = Arc<Mutex<Waiters>>;
type Handlers = Arc<Mutex<HashMap<String, CallbackHandler>>>;

/// Responders by key. `closed` is set by the router once the processor's output ends, under
/// the same lock new requests register through.
#[derive(Default)]
struct Waiters {
    responders: HashMap<QueryKey, oneshot::Sender<OutputMessage>>,
    closed: bool,
}

impl Waiters {
    fn register(
        &mut self,
        key: QueryKey,
        responder: oneshot::Sender<OutputMessage>,
    ) -> Result<(), SqlocalError> {
        if self.closed {
            return Err(connection_error("processor closed"));
        }
        if self.responders.contains_key(&key) {
            return Err(protocol_error(format!("correlation key {key} already in flight")));
        }
        self.responders.insert(key, responder);
        Ok(())
    }
}

pub(crate) struct Channel {
    processor: ProcessorHandle,
    pending: Pending,
    handlers: Handlers,
}

impl Channel {
    /// Wrap a processor and start routing its output. Must be called inside a tokio runtime.
    pub(crate) fn new(processor: ProcessorHandle, output: UnboundedReceiver<OutputMessage>) -> Self {
        let pending: Pending = Arc::default();
        let handlers: Handlers = Arc::default();
        tokio::spawn(route_output(
            output,
            Arc::clone(&pending),
            Arc::clone(&handlers),
        ));
        Self {
            processor,
            pending,
            handlers,
        }
    }

    /// Send without waiting, so the caller can release ordering locks before the response.
    pub(crate) fn send(&self, message: InputMessage) -> Result<PendingResponse, SqlocalError> {
        let key = message.key();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            pending.register(key, tx)?;
        }
        if let Err(err) = self.processor.send(message) {
            self.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .responders
                .remove(&key);
            return Err(err);
        }
        Ok(PendingResponse { key, rx })
    }

    pub(crate) async fn request(&self, message: InputMessage) -> Result<Response, SqlocalError> {
        self.send(message)?.recv().await
    }

    pub(crate) fn register_handler(&self, name: &str, handler: CallbackHandler) {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_owned(), handler);
    }
}

async fn route_output(
    mut output: UnboundedReceiver<OutputMessage>,
    pending: Pending,
    handlers: Handlers,
) {
    while let Some(message) = output.recv().await {
        let Some(key) = message.key() else {
            if let OutputMessage::Callback { name, args } = message {
                let handler = handlers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(&name)
                    .cloned();
                match handler {
                    Some(handler) => handler(args),
                    None => warn!(%name, "callback invoked without a registered handler"),
                }
            }
            continue;
        };
        let responder = pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .responders
            .remove(&key);
        match responder {
            Some(responder) => {
                let _ = responder.send(message);
            }
            None => debug!(%key, "response without a waiting request"),
        }
    }
    // Processor is gone: dropping the responders fails every waiter.
    let mut pending = pending.lock().unwrap_or_else(PoisonError::into_inner);
    pending.closed = true;
    pending.responders.clear();
    drop(pending);
    debug!("processor output closed; router stopped");
}

/// Decoded processor reply.
#[derive(Debug)]
pub(crate) enum Response {
    Unit {
        mutated_tables: BTreeSet<String>,
    },
    Data {
        results: Vec<ResultSet>,
        mutated_tables: BTreeSet<String>,
    },
    Buffer(DatabaseExport),
    Info(DatabaseInfo),
}

impl Response {
    pub(crate) fn into_unit(self) -> Result<BTreeSet<String>, SqlocalError> {
        match self {
            Response::Unit { mutated_tables } => Ok(mutated_tables),
            other => Err(unexpected(&other)),
        }
    }

    pub(crate) fn into_data(self) -> Result<(Vec<ResultSet>, BTreeSet<String>), SqlocalError> {
        match self {
            Response::Data {
                results,
                mutated_tables,
            } => Ok((results, mutated_tables)),
            other => Err(unexpected(&other)),
        }
    }

    pub(crate) fn into_buffer(self) -> Result<DatabaseExport, SqlocalError> {
        match self {
            Response::Buffer(export) => Ok(export),
            other => Err(unexpected(&other)),
        }
    }

    pub(crate) fn into_info(self) -> Result<DatabaseInfo, SqlocalError> {
        match self {
            Response::Info(info) => Ok(info),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(response: &Response) -> SqlocalError {
    protocol_error(format!("unexpected processor response {response:?}"))
}

/// A sent request whose response has not arrived yet.
pub(crate) struct PendingResponse {
    key: QueryKey,
    rx: oneshot::Receiver<OutputMessage>,
}

impl PendingResponse {
    pub(crate) async fn recv(self) -> Result<Response, SqlocalError> {
        let message = self
            .rx
            .await
            .map_err(|_| connection_error("processor dropped the request"))?;
        match message {
            OutputMessage::Success { mutated_tables, .. } => Ok(Response::Unit { mutated_tables }),
            OutputMessage::Data {
                results,
                mutated_tables,
                ..
            } => Ok(Response::Data {
                results,
                mutated_tables,
            }),
            OutputMessage::Buffer { export, .. } => Ok(Response::Buffer(export)),
            OutputMessage::Info { info, .. } => Ok(Response::Info(info)),
            OutputMessage::Error { error, .. } => Err(error),
            OutputMessage::Callback { .. } => Err(protocol_error(format!(
                "callback routed to request {}",
                self.key
            ))),
        }
    }
}
