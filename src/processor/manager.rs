use std::sync::mpsc::{self, Sender};
use std::thread;

use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};

use crate::driver::StorageDriver;
use crate::error::{SqlocalError, connection_error};

use super::dispatcher::run_processor;
use super::messages::{InputMessage, OutputMessage};

/// Sending half of a processor running on its own thread.
///
/// The thread exits after a `Destroy` message or once every handle is dropped.
#[derive(Clone)]
pub struct ProcessorHandle {
    sender: Sender<InputMessage>,
}

impl ProcessorHandle {
    /// Start a processor thread that owns `driver`.
    ///
    /// # Errors
    /// Returns [`SqlocalError::ConnectionError`] if the thread cannot be spawned.
    pub fn spawn<D: StorageDriver + 'static>(
        driver: D,
        name: &str,
    ) -> Result<(Self, UnboundedReceiver<OutputMessage>), SqlocalError> {
        let (sender, receiver) = mpsc::channel::<InputMessage>();
        let (output, responses) = unbounded_channel();
        thread::Builder::new()
            .name(format!("sqlocal-processor-{name}"))
            .spawn(move || run_processor(driver, &receiver, output))
            .map_err(|err| {
                SqlocalError::ConnectionError(format!("failed to spawn processor thread: {err}"))
            })?;
        Ok((Self { sender }, responses))
    }

    /// # Errors
    /// Returns [`SqlocalError::ConnectionError`] once the processor thread has exited.
    pub fn send(&self, message: InputMessage) -> Result<(), SqlocalError> {
        self.sender
            .send(message)
            .map_err(|_| connection_error("processor closed"))
    }
}
