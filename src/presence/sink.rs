//! Presence sinks.
//!
//! A sink is a blocking IPC endpoint. The synchronizer drives it from the
//! blocking thread pool, one call at a time.

use std::io;

use discord_rich_presence::{DiscordIpc, DiscordIpcClient};
use serde_json::Value;

use crate::error::{Error, Result};

/// IPC opcode carrying commands and their responses.
pub const OPCODE_FRAME: u8 = 1;

pub trait Sink: Send + 'static {
    /// Connects to the sink.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` when the sink is not running.
    fn connect(&mut self) -> Result<()>;

    /// Sends a command and returns the acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns an error if the command cannot be written or no
    /// acknowledgement can be read. A broken pipe maps to `Aborted`.
    fn send_command(&mut self, command: &Value) -> Result<Value>;

    /// Closes the connection, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection could not be closed cleanly.
    fn close(&mut self) -> Result<()>;
}

/// Sink talking to a Discord client, or a compatible shim, over local IPC.
pub struct IpcSink {
    client: DiscordIpcClient,
}

impl IpcSink {
    /// Creates a sink for the application `client_id` without connecting.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the IPC client cannot be created.
    pub fn new(client_id: &str) -> Result<Self> {
        let client = DiscordIpcClient::new(client_id)
            .map_err(|e| Error::invalid_argument(format!("presence client: {e}")))?;
        Ok(Self { client })
    }
}

impl Sink for IpcSink {
    fn connect(&mut self) -> Result<()> {
        self.client
            .connect()
            .map_err(|e| Error::unavailable(format!("Discord not found: {e}")))
    }

    fn send_command(&mut self, command: &Value) -> Result<Value> {
        self.client
            .send(command.clone(), OPCODE_FRAME)
            .map_err(|e| ipc_error(e.as_ref()))?;
        let (_opcode, ack) = self.client.recv().map_err(|e| ipc_error(e.as_ref()))?;
        Ok(ack)
    }

    fn close(&mut self) -> Result<()> {
        self.client
            .close()
            .map_err(|e| Error::unavailable(e.to_string()))
    }
}

/// Converts an IPC error, keeping the kind of underlying I/O errors.
///
/// The IPC client returns errors that are not `Send`, so they are rebuilt
/// here before crossing threads.
fn ipc_error(e: &(dyn std::error::Error + 'static)) -> Error {
    match e.downcast_ref::<io::Error>() {
        Some(io) => io::Error::new(io.kind(), io.to_string()).into(),
        None => Error::unknown(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn broken_pipe_keeps_its_kind() {
        let e: Box<dyn std::error::Error> =
            Box::new(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert_eq!(ipc_error(e.as_ref()).kind, ErrorKind::Aborted);

        let e: Box<dyn std::error::Error> = "bad frame".into();
        assert_eq!(ipc_error(e.as_ref()).kind, ErrorKind::Unknown);
    }
}

/// In-memory sink recording every command it receives.
#[cfg(test)]
pub(crate) mod mock {
    use std::sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    };

    use serde_json::json;

    use super::*;

    #[derive(Debug, Default)]
    pub struct Shared {
        /// Whether the sink is running and accepts connections.
        pub available: AtomicBool,
        /// Whether acknowledgements echo the activity in `data`.
        pub echo: AtomicBool,
        /// Error returned by the next send, if any.
        pub fail_with: Mutex<Option<io::ErrorKind>>,
        pub connects: AtomicUsize,
        pub sent: Mutex<Vec<Value>>,
    }

    impl Shared {
        pub fn sent(&self) -> Vec<Value> {
            self.sent.lock().unwrap().clone()
        }

        /// Activity types of all sent commands, in order.
        pub fn kinds(&self) -> Vec<u64> {
            self.sent()
                .iter()
                .map(|command| command["args"]["activity"]["type"].as_u64().unwrap())
                .collect()
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct MockSink(pub Arc<Shared>);

    impl MockSink {
        pub fn available(echo: bool) -> Self {
            let sink = Self::default();
            sink.0.available.store(true, Ordering::SeqCst);
            sink.0.echo.store(echo, Ordering::SeqCst);
            sink
        }
    }

    impl Sink for MockSink {
        fn connect(&mut self) -> Result<()> {
            self.0.connects.fetch_add(1, Ordering::SeqCst);
            if self.0.available.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(Error::unavailable("Discord not found"))
            }
        }

        fn send_command(&mut self, command: &Value) -> Result<Value> {
            if let Some(kind) = self.0.fail_with.lock().unwrap().take() {
                return Err(io::Error::from(kind).into());
            }
            self.0.sent.lock().unwrap().push(command.clone());

            let mut ack = json!({ "cmd": "SET_ACTIVITY", "evt": null, "nonce": command["nonce"] });
            if self.0.echo.load(Ordering::SeqCst) {
                ack["data"] = command["args"]["activity"].clone();
            }
            Ok(ack)
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }
}
