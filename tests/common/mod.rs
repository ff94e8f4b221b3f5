// Loopback test server: accepts one connection and hands it to a
// per-test script. Frame and message helpers are built out of the
// crate's own codec, exercised from the server side.

#![allow(dead_code)]

use bytes::BytesMut;
use ldap_async_client::protocol::{
    self, Control, LdapMessage, LdapResult, ProtocolOp, SearchResultEntry,
};
use ldap_async_client::Attribute;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Once;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

static INIT: Once = Once::new();

/// Opt-in log output for debugging: RUST_LOG=trace cargo test.
pub fn init_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// Bind a listener, spawn the script against the first connection, and
/// return the address to dial plus the script's join handle.
pub async fn spawn_server<F, Fut>(script: F) -> (SocketAddr, JoinHandle<()>)
where
    F: FnOnce(TcpStream) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    init_logging();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        script(stream).await;
    });
    (addr, handle)
}

pub fn url_for(addr: SocketAddr) -> String {
    format!("ldap://{}", addr)
}

/// Read one request frame: (message id, op tag, request controls).
/// `None` on client EOF.
pub async fn read_request(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
) -> Option<(i32, u8, Vec<Control>)> {
    loop {
        if let Some(total) = protocol::frame_length(buf).unwrap() {
            if buf.len() >= total {
                let frame = buf.split_to(total);
                return Some(protocol::parse_envelope(&frame).unwrap());
            }
        }
        let n = stream.read_buf(buf).await.unwrap();
        if n == 0 {
            return None;
        }
    }
}

pub async fn send(stream: &mut TcpStream, msg: &LdapMessage) {
    let bytes = protocol::encode_ldap_message(msg);
    stream.write_all(&bytes).await.unwrap();
}

pub fn result(rc: i32, text: &str) -> LdapResult {
    LdapResult {
        result_code: rc,
        matched_dn: String::new(),
        diagnostic_message: text.to_string(),
        controls: Vec::new(),
    }
}

pub fn bind_ok(message_id: i32) -> LdapMessage {
    LdapMessage {
        message_id,
        protocol_op: ProtocolOp::BindResponse(result(0, "")),
        controls: None,
    }
}

pub fn entry(message_id: i32, dn: &str) -> LdapMessage {
    LdapMessage {
        message_id,
        protocol_op: ProtocolOp::SearchResultEntry(SearchResultEntry {
            object_name: dn.to_string(),
            attributes: vec![Attribute {
                attr_type: "cn".to_string(),
                attr_values: vec![b"x".to_vec()],
            }],
        }),
        controls: None,
    }
}

pub fn search_done(message_id: i32, controls: Option<Vec<Control>>) -> LdapMessage {
    LdapMessage {
        message_id,
        protocol_op: ProtocolOp::SearchResultDone(result(0, "")),
        controls,
    }
}
