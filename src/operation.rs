// Per-operation handle: the channel end of one registered message id,
// plus abandon and timeout plumbing.

use crate::dispatcher::{OpItem, Shared};
use crate::error::{LdapError, Result};
use crate::protocol::{is_terminal_response_tag, LdapMessage, LdapResult, ProtocolOp};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Handle to one in-flight operation. Yields every envelope the server
/// sends for this message id, ending with the terminal response.
pub struct OperationHandle {
    message_id: i32,
    rx: mpsc::UnboundedReceiver<OpItem>,
    shared: Arc<Shared>,
    /// First failure seen; replayed on every later call.
    failed: Option<LdapError>,
    cancelled: bool,
    done: bool,
}

impl OperationHandle {
    pub(crate) fn new(
        message_id: i32,
        rx: mpsc::UnboundedReceiver<OpItem>,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            message_id,
            rx,
            shared,
            failed: None,
            cancelled: false,
            done: false,
        }
    }

    /// Message id this operation was sent with.
    pub fn message_id(&self) -> i32 {
        self.message_id
    }

    /// Next envelope for this operation. `Ok(None)` means the terminal
    /// response was already consumed and nothing further will arrive.
    pub async fn next(&mut self) -> Result<Option<LdapMessage>> {
        if let Some(ref err) = self.failed {
            return Err(err.clone());
        }
        if self.cancelled {
            return Err(LdapError::Cancelled);
        }
        if self.done {
            return Ok(None);
        }
        match self.rx.recv().await {
            Some(OpItem::Message(msg)) => {
                if is_terminal_response_tag(msg.protocol_op.tag()) {
                    self.done = true;
                }
                Ok(Some(msg))
            }
            Some(OpItem::Failed(err)) => {
                self.failed = Some(err.clone());
                Err(err)
            }
            // Sender dropped without a terminal message: the dispatcher
            // was torn down under us.
            None => {
                let err = LdapError::ConnectionClosed;
                self.failed = Some(err.clone());
                Err(err)
            }
        }
    }

    /// `next` with a deadline. On timeout the operation stays registered:
    /// the caller decides whether to keep waiting or abandon.
    pub async fn next_timeout(&mut self, timeout: Duration) -> Result<Option<LdapMessage>> {
        match tokio::time::timeout(timeout, self.next()).await {
            Ok(result) => result,
            Err(_) => Err(LdapError::TimedOut),
        }
    }

    /// Abandon the operation: deregister locally, then tell the server.
    /// The abandon request itself has no response; any replies already in
    /// flight for this id are discarded by the dispatcher.
    pub fn abandon(&mut self) {
        if self.cancelled || self.done {
            return;
        }
        self.cancelled = true;
        self.shared.remove(self.message_id);
        // Fire-and-forget; the server sends no reply to an abandon, and
        // any late responses for our id are dropped by the dispatcher.
        let _ = self
            .shared
            .send_unregistered(ProtocolOp::AbandonRequest(self.message_id));
        debug!(message_id = self.message_id, "abandoning operation");
    }

    /// Drain remaining envelopes until the terminal response and return
    /// its result fields, with any message-level response controls
    /// attached. Intermediate envelopes are discarded.
    pub async fn finish(&mut self) -> Result<LdapResult> {
        loop {
            match self.next().await? {
                Some(msg) => {
                    if let Some(result) = terminal_result(&msg) {
                        return Ok(result);
                    }
                }
                None => return Err(LdapError::ConnectionClosed),
            }
        }
    }
}

/// Extract the LdapResult from a terminal envelope, folding the
/// message-level controls into it. `None` for entries, references and
/// intermediate responses.
pub(crate) fn terminal_result(msg: &LdapMessage) -> Option<LdapResult> {
    let result = match &msg.protocol_op {
        ProtocolOp::BindResponse(r)
        | ProtocolOp::SearchResultDone(r)
        | ProtocolOp::ModifyResponse(r)
        | ProtocolOp::AddResponse(r)
        | ProtocolOp::DelResponse(r)
        | ProtocolOp::ModifyDnResponse(r)
        | ProtocolOp::CompareResponse(r) => r.clone(),
        ProtocolOp::ExtendedResponse(resp) => resp.result.clone(),
        _ => return None,
    };
    let mut result = result;
    if let Some(ref controls) = msg.controls {
        result.controls = controls.clone();
    }
    Some(result)
}
