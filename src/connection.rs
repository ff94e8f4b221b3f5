// Connection facade: lifecycle state, bind/search/modify entry points,
// and graceful close. One dispatcher per connection.

use crate::dispatcher::Dispatcher;
use crate::error::{LdapError, Result};
use crate::operation::OperationHandle;
use crate::protocol::{
    AddRequest, Attribute, BindAuthentication, BindRequest, CompareRequest, Control, DelRequest,
    DerefAliases, ExtendedRequest, Filter, LdapMessage, LdapResult, ModifyDnRequest, ModifyRequest,
    ProtocolOp, SearchRequest, SearchScope,
};
use crate::transport::{parse_ldap_url, LdapStream, TlsOptions};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// "Who am I?" extended operation (RFC 4532).
pub const OID_WHO_AM_I: &str = "1.3.6.1.4.1.4203.1.11.3";

const LDAP_VERSION: i32 = 3;

/// Connection tuning. All fields have defaults, so a YAML/JSON fragment
/// only needs the ones it changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectOptions {
    /// Deadline for TCP connect and TLS handshakes.
    #[serde(default = "default_network_timeout_secs")]
    pub network_timeout_secs: u64,
    /// How long unbind waits for the server to close the stream before
    /// tearing it down anyway.
    #[serde(default = "default_close_grace_secs")]
    pub close_grace_secs: u64,
    /// Per-operation deadline used by the single-shot helpers
    /// (bind, add, modify, ...). Streaming handles manage their own.
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
    /// Upgrade a plaintext connection with StartTLS before any operation.
    /// Ignored for ldaps:// URLs, which are already encrypted.
    #[serde(default)]
    pub starttls: bool,
    /// Accept any server certificate. Test environments only.
    #[serde(default)]
    pub tls_skip_verify: bool,
    /// Extra CA certificates (PEM) trusted in addition to system roots.
    #[serde(default)]
    pub tls_extra_ca_pem: Option<Vec<u8>>,
}

fn default_network_timeout_secs() -> u64 {
    30
}

fn default_close_grace_secs() -> u64 {
    5
}

fn default_operation_timeout_secs() -> u64 {
    60
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            network_timeout_secs: default_network_timeout_secs(),
            close_grace_secs: default_close_grace_secs(),
            operation_timeout_secs: default_operation_timeout_secs(),
            starttls: false,
            tls_skip_verify: false,
            tls_extra_ca_pem: None,
        }
    }
}

impl ConnectOptions {
    fn tls_options(&self) -> TlsOptions {
        TlsOptions {
            skip_verify: self.tls_skip_verify,
            extra_ca_pem: self.tls_extra_ca_pem.clone(),
        }
    }

    fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

/// Observable lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Transport up, no bind yet (anonymous).
    Connected { secure: bool },
    /// Authenticated as `dn` (empty for an anonymous bind).
    Bound { dn: String, secure: bool },
    Closing,
    Closed,
}

/// One LDAP connection. Cheap to share behind an Arc; all operations
/// take `&self` and multiplex over the same dispatcher.
pub struct LdapConnection {
    dispatcher: Dispatcher,
    state: Mutex<ConnectionState>,
    options: ConnectOptions,
}

impl LdapConnection {
    /// Connect with default options.
    pub async fn connect(url: &str) -> Result<LdapConnection> {
        Self::connect_with(url, ConnectOptions::default()).await
    }

    /// Connect to `ldap://host[:port]` or `ldaps://host[:port]`.
    pub async fn connect_with(url: &str, options: ConnectOptions) -> Result<LdapConnection> {
        let parsed = parse_ldap_url(url)?;
        let tls = options.tls_options();
        let network_timeout = Duration::from_secs(options.network_timeout_secs);

        let stream = tokio::time::timeout(network_timeout, LdapStream::connect(&parsed, &tls))
            .await
            .map_err(|_| LdapError::TimedOut)??;

        let stream = if options.starttls && !stream.is_tls() {
            // Runs before the dispatcher exists, so the raw exchange
            // cannot race another operation. Id 1 is free to be reused
            // afterwards: uniqueness only matters among in-flight ops.
            tokio::time::timeout(
                network_timeout,
                stream.upgrade_starttls(&parsed.host, &tls, 1),
            )
            .await
            .map_err(|_| LdapError::TimedOut)??
        } else {
            stream
        };

        let secure = stream.is_tls();
        info!(host = %parsed.host, port = parsed.port, secure, "connected");
        Ok(LdapConnection {
            dispatcher: Dispatcher::start(stream),
            state: Mutex::new(ConnectionState::Connected { secure }),
            options,
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_secure(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Connected { secure: true } | ConnectionState::Bound { secure: true, .. }
        )
    }

    fn check_open(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Closing | ConnectionState::Closed => {
                Err(LdapError::ConnectionClosed)
            }
            _ if self.dispatcher.is_dead() => Err(LdapError::TransportUnavailable),
            _ => Ok(()),
        }
    }

    /// Simple bind. Rebinding on a live connection is allowed and
    /// replaces the current authorization identity.
    pub async fn simple_bind(&self, dn: &str, password: &str) -> Result<LdapResult> {
        self.bind(BindRequest {
            version: LDAP_VERSION,
            name: dn.to_string(),
            authentication: BindAuthentication::Simple(password.to_string()),
        })
        .await
    }

    /// One round of a SASL bind. Mechanisms needing multiple rounds can
    /// inspect the returned result and call again with new credentials.
    pub async fn sasl_bind(
        &self,
        dn: &str,
        mechanism: &str,
        credentials: Option<Vec<u8>>,
    ) -> Result<LdapResult> {
        self.bind(BindRequest {
            version: LDAP_VERSION,
            name: dn.to_string(),
            authentication: BindAuthentication::Sasl {
                mechanism: mechanism.to_string(),
                credentials,
            },
        })
        .await
    }

    async fn bind(&self, request: BindRequest) -> Result<LdapResult> {
        self.check_open()?;
        let dn = request.name.clone();
        let mut handle = self.submit(ProtocolOp::BindRequest(request), None)?;
        let result = self.finish_with_deadline(&mut handle).await?.success()?;
        let secure = self.is_secure();
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) =
            ConnectionState::Bound { dn, secure };
        Ok(result)
    }

    /// Streaming search with a filter string, subtree scope defaults left
    /// to the request. Entries arrive through the returned handle.
    pub async fn search(
        &self,
        base: &str,
        scope: SearchScope,
        filter: &str,
        attributes: &[&str],
    ) -> Result<OperationHandle> {
        let request = SearchRequest {
            base_object: base.to_string(),
            scope,
            deref_aliases: DerefAliases::Never,
            size_limit: 0,
            time_limit: 0,
            types_only: false,
            filter: Filter::parse(filter)?,
            attributes: attributes.iter().map(|s| s.to_string()).collect(),
        };
        self.search_request(request, None).await
    }

    /// Full-control search entry point; the paging layer goes through
    /// here with its request controls.
    pub async fn search_request(
        &self,
        request: SearchRequest,
        controls: Option<Vec<Control>>,
    ) -> Result<OperationHandle> {
        self.check_open()?;
        self.submit(ProtocolOp::SearchRequest(request), controls)
    }

    pub async fn add(&self, entry: &str, attributes: Vec<Attribute>) -> Result<LdapResult> {
        self.single_shot(ProtocolOp::AddRequest(AddRequest {
            entry: entry.to_string(),
            attributes,
        }))
        .await
    }

    pub async fn delete(&self, entry: &str) -> Result<LdapResult> {
        self.single_shot(ProtocolOp::DelRequest(DelRequest {
            entry: entry.to_string(),
        }))
        .await
    }

    pub async fn modify(
        &self,
        object: &str,
        changes: Vec<crate::protocol::ModifyChange>,
    ) -> Result<LdapResult> {
        self.single_shot(ProtocolOp::ModifyRequest(ModifyRequest {
            object: object.to_string(),
            changes,
        }))
        .await
    }

    pub async fn modify_dn(
        &self,
        entry: &str,
        newrdn: &str,
        delete_old_rdn: bool,
        new_superior: Option<&str>,
    ) -> Result<LdapResult> {
        self.single_shot(ProtocolOp::ModifyDnRequest(ModifyDnRequest {
            entry: entry.to_string(),
            newrdn: newrdn.to_string(),
            delete_old_rdn,
            new_superior: new_superior.map(|s| s.to_string()),
        }))
        .await
    }

    /// Compare an attribute value. Ok(true) for compareTrue, Ok(false)
    /// for compareFalse; anything else is a server error.
    pub async fn compare(&self, entry: &str, attr: &str, value: &[u8]) -> Result<bool> {
        self.check_open()?;
        let mut handle = self.submit(
            ProtocolOp::CompareRequest(CompareRequest {
                entry: entry.to_string(),
                attr: attr.to_string(),
                assertion_value: value.to_vec(),
            }),
            None,
        )?;
        let result = self.finish_with_deadline(&mut handle).await?.success()?;
        Ok(result.result_code == LdapResult::COMPARE_TRUE)
    }

    /// Run an extended operation and return its full response, including
    /// the response name and value.
    pub async fn extended(
        &self,
        request_name: &str,
        request_value: Option<Vec<u8>>,
    ) -> Result<crate::protocol::ExtendedResponse> {
        self.check_open()?;
        let mut handle = self.submit(
            ProtocolOp::ExtendedRequest(ExtendedRequest {
                request_name: request_name.to_string(),
                request_value,
            }),
            None,
        )?;
        let deadline = self.options.operation_timeout();
        loop {
            match handle.next_timeout(deadline).await? {
                Some(msg) => {
                    if let ProtocolOp::ExtendedResponse(resp) = msg.protocol_op {
                        resp.result.clone().success()?;
                        return Ok(resp);
                    }
                    // Intermediate responses are skipped here; callers
                    // that need them use submit/next directly.
                }
                None => return Err(LdapError::ConnectionClosed),
            }
        }
    }

    /// RFC 4532 "Who am I?": the server's view of our authorization id.
    pub async fn whoami(&self) -> Result<String> {
        let resp = self.extended(OID_WHO_AM_I, None).await?;
        Ok(resp
            .response_value
            .map(|v| String::from_utf8_lossy(&v).into_owned())
            .unwrap_or_default())
    }

    /// Receiver for server-initiated messages: unsolicited notifications
    /// (message id 0, including Notice of Disconnection) and responses
    /// for ids no longer registered.
    pub fn unsolicited(&self) -> broadcast::Receiver<LdapMessage> {
        self.dispatcher.subscribe_unsolicited()
    }

    /// Graceful close: send unbind (which has no response), give the
    /// server a grace period to close the stream, then tear down. All
    /// operations still in flight complete with `ConnectionClosed`.
    pub async fn unbind(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if matches!(*state, ConnectionState::Closing | ConnectionState::Closed) {
                return;
            }
            *state = ConnectionState::Closing;
        }
        let _ = self.dispatcher.send_unregistered(ProtocolOp::UnbindRequest);

        let mut closed = self.dispatcher.closed_signal();
        let grace = Duration::from_secs(self.options.close_grace_secs);
        // `is_err()` here also drops the `watch::Ref` guard returned by
        // `wait_for`; holding it across `shutdown` would block the
        // dispatcher's write to the same watch channel.
        let waited = tokio::time::timeout(grace, closed.wait_for(|dead| *dead))
            .await
            .is_err();
        if waited {
            debug!("server did not close within grace period, forcing shutdown");
        }
        self.dispatcher.shutdown();
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = ConnectionState::Closed;
    }

    pub(crate) fn submit(
        &self,
        op: ProtocolOp,
        controls: Option<Vec<Control>>,
    ) -> Result<OperationHandle> {
        let (id, rx) = self.dispatcher.submit(op, controls)?;
        Ok(OperationHandle::new(id, rx, self.dispatcher.shared()))
    }

    async fn single_shot(&self, op: ProtocolOp) -> Result<LdapResult> {
        self.check_open()?;
        let mut handle = self.submit(op, None)?;
        self.finish_with_deadline(&mut handle).await?.success()
    }

    async fn finish_with_deadline(&self, handle: &mut OperationHandle) -> Result<LdapResult> {
        tokio::time::timeout(self.options.operation_timeout(), handle.finish())
            .await
            .map_err(|_| LdapError::TimedOut)?
    }
}
