// Message dispatcher: owns the transport, correlates every inbound
// envelope to the pending operation that requested it, and fans failures
// out to everything in flight when the stream dies.

use crate::error::{LdapError, Result};
use crate::protocol::{
    self, expected_response_tags, is_terminal_response_tag, Control, LdapMessage, ProtocolOp,
};
use crate::transport::LdapStream;
use bytes::BytesMut;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Notice of Disconnection unsolicited notification (RFC 4511 §4.4.1).
pub const OID_NOTICE_OF_DISCONNECTION: &str = "1.3.6.1.4.1.1466.20036";

const READ_CHUNK: usize = 4096;

/// Item delivered to an operation's channel by the reader task.
#[derive(Debug)]
pub(crate) enum OpItem {
    Message(LdapMessage),
    Failed(LdapError),
}

struct PendingEntry {
    tx: mpsc::UnboundedSender<OpItem>,
    expected_tags: &'static [u8],
}

struct Registry {
    next_id: i32,
    entries: HashMap<i32, PendingEntry>,
    /// Set once the stream has failed; all later submits bounce.
    dead: Option<LdapError>,
}

impl Registry {
    /// Allocate the next free message id. Ids are positive, monotonic,
    /// wrap at i32::MAX, and never collide with one still in flight.
    fn allocate_id(&mut self) -> i32 {
        loop {
            let id = self.next_id;
            self.next_id = if self.next_id == i32::MAX {
                1
            } else {
                self.next_id + 1
            };
            if !self.entries.contains_key(&id) {
                return id;
            }
        }
    }
}

pub(crate) struct Shared {
    registry: Mutex<Registry>,
    writer_tx: mpsc::UnboundedSender<Vec<u8>>,
    unsolicited_tx: broadcast::Sender<LdapMessage>,
    /// Flips to true the first time fail_all runs.
    dead_tx: watch::Sender<bool>,
}

impl Shared {
    /// Fail every pending operation and mark the dispatcher dead. Safe to
    /// call more than once; the first error wins.
    pub(crate) fn fail_all(&self, err: LdapError) {
        let entries = {
            let mut reg = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            if reg.dead.is_none() {
                reg.dead = Some(err.clone());
            }
            std::mem::take(&mut reg.entries)
        };
        if !entries.is_empty() {
            debug!(pending = entries.len(), error = %err, "failing in-flight operations");
        }
        for (_, entry) in entries {
            let _ = entry.tx.send(OpItem::Failed(err.clone()));
        }
        let _ = self.dead_tx.send(true);
    }

    /// Drop an operation's registry entry. Responses that arrive later for
    /// this id are discarded by the reader.
    pub(crate) fn remove(&self, message_id: i32) {
        let mut reg = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        reg.entries.remove(&message_id);
    }

    /// Send a request without registering a response channel. Used for
    /// abandon and unbind, which have no responses. The message still
    /// gets a fresh id of its own.
    pub(crate) fn send_unregistered(&self, op: ProtocolOp) -> Result<i32> {
        let message_id = {
            let mut reg = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(ref err) = reg.dead {
                return Err(err.clone());
            }
            reg.allocate_id()
        };
        let bytes = protocol::encode_ldap_message(&LdapMessage {
            message_id,
            protocol_op: op,
            controls: None,
        });
        self.writer_tx
            .send(bytes)
            .map_err(|_| LdapError::TransportUnavailable)?;
        Ok(message_id)
    }
}

/// Handle over the reader and writer tasks for one connection.
pub(crate) struct Dispatcher {
    shared: Arc<Shared>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl Dispatcher {
    /// Split the stream and spawn the reader and writer tasks.
    pub(crate) fn start(stream: LdapStream) -> Dispatcher {
        let (read_half, write_half) = tokio::io::split(stream);
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (unsolicited_tx, _) = broadcast::channel(16);
        let (dead_tx, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            registry: Mutex::new(Registry {
                next_id: 1,
                entries: HashMap::new(),
                dead: None,
            }),
            writer_tx,
            unsolicited_tx,
            dead_tx,
        });

        let writer_shared = Arc::clone(&shared);
        let writer_task = tokio::spawn(async move {
            run_writer(write_half, writer_rx, writer_shared).await;
        });

        let reader_shared = Arc::clone(&shared);
        let reader_task = tokio::spawn(async move {
            run_reader(read_half, reader_shared).await;
        });

        Dispatcher {
            shared,
            reader_task,
            writer_task,
        }
    }

    pub(crate) fn shared(&self) -> Arc<Shared> {
        Arc::clone(&self.shared)
    }

    /// Register a pending operation, then queue its encoded request.
    /// Registration happens first so a response racing the send cannot be
    /// dropped. Returns the allocated id and the response channel.
    pub(crate) fn submit(
        &self,
        op: ProtocolOp,
        controls: Option<Vec<Control>>,
    ) -> Result<(i32, mpsc::UnboundedReceiver<OpItem>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let message_id = {
            let mut reg = self
                .shared
                .registry
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if let Some(ref err) = reg.dead {
                return Err(err.clone());
            }
            let id = reg.allocate_id();
            reg.entries.insert(
                id,
                PendingEntry {
                    tx,
                    expected_tags: expected_response_tags(&op),
                },
            );
            id
        };

        let bytes = protocol::encode_ldap_message(&LdapMessage {
            message_id,
            protocol_op: op,
            controls,
        });
        trace!(message_id, len = bytes.len(), "submitting request");
        if self.shared.writer_tx.send(bytes).is_err() {
            self.shared.remove(message_id);
            return Err(LdapError::TransportUnavailable);
        }
        Ok((message_id, rx))
    }

    /// Send a request that expects no response (unbind, abandon).
    pub(crate) fn send_unregistered(&self, op: ProtocolOp) -> Result<i32> {
        self.shared.send_unregistered(op)
    }

    pub(crate) fn subscribe_unsolicited(&self) -> broadcast::Receiver<LdapMessage> {
        self.shared.unsolicited_tx.subscribe()
    }

    /// Watch that flips to true once the stream has failed or closed.
    pub(crate) fn closed_signal(&self) -> watch::Receiver<bool> {
        self.shared.dead_tx.subscribe()
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.shared
            .registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .dead
            .is_some()
    }

    /// Stop both tasks. Any operations still pending are failed.
    pub(crate) fn shutdown(&self) {
        self.shared.fail_all(LdapError::ConnectionClosed);
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_writer(
    mut write_half: tokio::io::WriteHalf<LdapStream>,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    shared: Arc<Shared>,
) {
    while let Some(bytes) = rx.recv().await {
        if let Err(e) = write_half.write_all(&bytes).await {
            warn!(error = %e, "write failed");
            shared.fail_all(e.into());
            return;
        }
        if let Err(e) = write_half.flush().await {
            warn!(error = %e, "flush failed");
            shared.fail_all(e.into());
            return;
        }
    }
    // Channel closed: connection is shutting down.
    let _ = write_half.shutdown().await;
}

async fn run_reader(mut read_half: tokio::io::ReadHalf<LdapStream>, shared: Arc<Shared>) {
    let mut buffer = BytesMut::with_capacity(READ_CHUNK);
    loop {
        loop {
            match protocol::decode_message(&mut buffer) {
                Ok(protocol::Decoded::Message(msg)) => route_message(&shared, msg),
                Ok(protocol::Decoded::Incomplete) => break,
                Err(e) => {
                    // BER offers no resynchronization point: any framing
                    // or parse error poisons the whole stream.
                    warn!(error = %e, "protocol decode failed, closing connection");
                    shared.fail_all(e);
                    return;
                }
            }
        }
        match read_half.read_buf(&mut buffer).await {
            Ok(0) => {
                debug!("connection closed by peer");
                shared.fail_all(LdapError::ConnectionClosed);
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "read failed");
                shared.fail_all(e.into());
                return;
            }
        }
    }
}

fn route_message(shared: &Shared, msg: LdapMessage) {
    let tag = msg.protocol_op.tag();

    if msg.message_id == 0 {
        // Unsolicited notification. Notice of Disconnection means the
        // server will drop the transport; the subsequent EOF fails the
        // remaining operations.
        if let ProtocolOp::ExtendedResponse(ref resp) = msg.protocol_op {
            if resp.response_name.as_deref() == Some(OID_NOTICE_OF_DISCONNECTION) {
                warn!(
                    rc = resp.result.result_code,
                    text = %resp.result.diagnostic_message,
                    "server sent Notice of Disconnection"
                );
            }
        }
        let _ = shared.unsolicited_tx.send(msg);
        return;
    }

    let terminal = is_terminal_response_tag(tag);
    let entry = {
        let mut reg = shared.registry.lock().unwrap_or_else(|e| e.into_inner());
        if terminal {
            reg.entries.remove(&msg.message_id)
        } else {
            reg.entries.get(&msg.message_id).map(|e| PendingEntry {
                tx: e.tx.clone(),
                expected_tags: e.expected_tags,
            })
        }
    };

    match entry {
        Some(entry) => {
            if !entry.expected_tags.is_empty() && !entry.expected_tags.contains(&tag) {
                debug!(
                    message_id = msg.message_id,
                    tag = format_args!("0x{:02X}", tag),
                    "response tag does not match the pending request"
                );
            }
            let message_id = msg.message_id;
            if entry.tx.send(OpItem::Message(msg)).is_err() && !terminal {
                // Receiver is gone (handle dropped without abandon);
                // stop holding the entry.
                shared.remove(message_id);
            }
        }
        None => {
            // Unknown id: either a late reply for an abandoned operation
            // or something truly server-initiated. Hand it to the
            // unsolicited sink instead of discarding.
            trace!(
                message_id = msg.message_id,
                tag = format_args!("0x{:02X}", tag),
                "routing response for unknown message id to unsolicited sink"
            );
            let _ = shared.unsolicited_tx.send(msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_registry() -> Registry {
        Registry {
            next_id: 1,
            entries: HashMap::new(),
            dead: None,
        }
    }

    #[test]
    fn ids_are_monotonic_from_one() {
        let mut reg = new_registry();
        assert_eq!(reg.allocate_id(), 1);
        assert_eq!(reg.allocate_id(), 2);
        assert_eq!(reg.allocate_id(), 3);
    }

    #[test]
    fn id_allocation_wraps_and_skips_in_use() {
        let mut reg = new_registry();
        reg.next_id = i32::MAX;
        let (tx, _rx) = mpsc::unbounded_channel();
        reg.entries.insert(
            1,
            PendingEntry {
                tx,
                expected_tags: &[],
            },
        );
        assert_eq!(reg.allocate_id(), i32::MAX);
        // Wraps to 1, which is in use, so 2 comes out. Zero is never
        // produced: it is reserved for unsolicited notifications.
        assert_eq!(reg.allocate_id(), 2);
    }
}
