// Plain-TCP and TLS byte transports plus the StartTLS upgrade. Everything
// above this module sees one `LdapStream` type.

use crate::error::{LdapError, Result};
use crate::protocol::{
    self, ExtendedRequest, ExtendedResponse, LdapMessage, ProtocolOp,
};
use bytes::BytesMut;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::ClientConfig;
use rustls::SignatureScheme;
use rustls_pki_types::ServerName;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// StartTLS extended operation (RFC 4511 §4.14).
pub const OID_START_TLS: &str = "1.3.6.1.4.1.1466.20037";

/// Parsed `ldap://` / `ldaps://` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapUrl {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

/// Parse "ldap://host[:port]" or "ldaps://host[:port]". Default ports are
/// 389 and 636 respectively.
pub fn parse_ldap_url(url: &str) -> Result<LdapUrl> {
    let (rest, use_tls) = if let Some(rest) = url.strip_prefix("ldap://") {
        (rest, false)
    } else if let Some(rest) = url.strip_prefix("ldaps://") {
        (rest, true)
    } else {
        return Err(LdapError::Transport(format!(
            "invalid LDAP URL scheme: {}",
            url
        )));
    };
    let rest = rest.trim_end_matches('/');
    if rest.is_empty() {
        return Err(LdapError::Transport(format!("missing host in URL: {}", url)));
    }
    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port_str)) => {
            let port = port_str.parse::<u16>().map_err(|_| {
                LdapError::Transport(format!("invalid port in URL: {}", url))
            })?;
            (host.to_string(), port)
        }
        None => (rest.to_string(), if use_tls { 636 } else { 389 }),
    };
    if host.is_empty() {
        return Err(LdapError::Transport(format!("missing host in URL: {}", url)));
    }
    Ok(LdapUrl {
        host,
        port,
        use_tls,
    })
}

/// TLS knobs shared by ldaps:// and StartTLS.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// Accept any server certificate. Test environments only.
    pub skip_verify: bool,
    /// Extra CA certificates (PEM) added to the system roots.
    pub extra_ca_pem: Option<Vec<u8>>,
}

/// A connected transport, before or after TLS.
pub enum LdapStream {
    Tcp(TcpStream),
    Tls(ClientTlsStream<TcpStream>),
}

impl LdapStream {
    pub fn is_tls(&self) -> bool {
        matches!(self, LdapStream::Tls(_))
    }

    /// Open a TCP connection and, for ldaps URLs, complete the TLS
    /// handshake immediately.
    pub async fn connect(url: &LdapUrl, tls: &TlsOptions) -> Result<LdapStream> {
        let addr = format!("{}:{}", url.host, url.port);
        debug!(addr = %addr, tls = url.use_tls, "connecting");
        let tcp = TcpStream::connect(&addr).await?;
        tcp.set_nodelay(true)?;
        if url.use_tls {
            tls_handshake(tcp, &url.host, tls).await
        } else {
            Ok(LdapStream::Tcp(tcp))
        }
    }

    /// Issue a StartTLS extended operation on a plaintext stream and
    /// upgrade in place. Must run before any other operation is in
    /// flight: the exchange reads the raw stream directly.
    pub async fn upgrade_starttls(
        self,
        host: &str,
        tls: &TlsOptions,
        message_id: i32,
    ) -> Result<LdapStream> {
        let mut stream = match self {
            LdapStream::Tcp(tcp) => tcp,
            LdapStream::Tls(_) => {
                return Err(LdapError::Transport(
                    "StartTLS on an already-encrypted stream".into(),
                ))
            }
        };

        let request = protocol::encode_ldap_message(&LdapMessage {
            message_id,
            protocol_op: ProtocolOp::ExtendedRequest(ExtendedRequest {
                request_name: OID_START_TLS.to_string(),
                request_value: None,
            }),
            controls: None,
        });
        stream.write_all(&request).await?;
        stream.flush().await?;

        let reply = read_one_message(&mut stream).await?;
        if reply.message_id != message_id {
            return Err(LdapError::ProtocolDecode(format!(
                "StartTLS reply for message id {}, expected {}",
                reply.message_id, message_id
            )));
        }
        match reply.protocol_op {
            ProtocolOp::ExtendedResponse(ExtendedResponse { result, .. }) => {
                result.success()?;
            }
            other => {
                return Err(LdapError::ProtocolDecode(format!(
                    "unexpected StartTLS reply tag 0x{:02X}",
                    other.tag()
                )))
            }
        }
        debug!(host = %host, "StartTLS accepted, upgrading");
        tls_handshake(stream, host, tls).await
    }
}

/// Read exactly one framed message from a raw stream. Only used for the
/// StartTLS exchange; steady-state reads go through the dispatcher.
async fn read_one_message(stream: &mut TcpStream) -> Result<LdapMessage> {
    let mut buffer = BytesMut::with_capacity(512);
    loop {
        match protocol::decode_message(&mut buffer)? {
            protocol::Decoded::Message(msg) => return Ok(msg),
            protocol::Decoded::Incomplete => {}
        }
        let n = stream.read_buf(&mut buffer).await?;
        if n == 0 {
            return Err(LdapError::ConnectionClosed);
        }
    }
}

async fn tls_handshake(tcp: TcpStream, host: &str, tls: &TlsOptions) -> Result<LdapStream> {
    let config = if tls.skip_verify {
        tls_client_config_insecure()?
    } else {
        tls_client_config_with_ca(tls.extra_ca_pem.as_deref())?
    };
    let connector = TlsConnector::from(config);
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| LdapError::Transport(format!("invalid hostname for TLS SNI: {}", host)))?;
    let stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| LdapError::Transport(format!("TLS handshake to {} failed: {}", host, e)))?;
    Ok(LdapStream::Tls(stream))
}

/// Verifier that accepts any server certificate. Only reachable through
/// `TlsOptions::skip_verify`.
#[derive(Debug)]
struct InsecureServerVerifier;

impl ServerCertVerifier for InsecureServerVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls_pki_types::CertificateDer<'_>,
        _intermediates: &[rustls_pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls_pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls_pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ED25519,
        ]
    }
}

fn tls_client_config_insecure() -> Result<Arc<ClientConfig>> {
    let mut root_store = rustls::RootCertStore::empty();
    for cert in load_native_certs()? {
        let _ = root_store.add(cert);
    }
    let mut config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    config
        .dangerous()
        .set_certificate_verifier(Arc::new(InsecureServerVerifier));
    Ok(Arc::new(config))
}

fn tls_client_config_with_ca(extra_ca_pem: Option<&[u8]>) -> Result<Arc<ClientConfig>> {
    let mut root_store = rustls::RootCertStore::empty();
    for cert in load_native_certs()? {
        let _ = root_store.add(cert);
    }
    if let Some(pem) = extra_ca_pem {
        for cert in rustls_pemfile::certs(&mut std::io::Cursor::new(pem)) {
            let cert =
                cert.map_err(|e| LdapError::Transport(format!("parse CA PEM: {}", e)))?;
            let _ = root_store.add(cert);
        }
    }
    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

fn load_native_certs() -> Result<Vec<rustls_pki_types::CertificateDer<'static>>> {
    rustls_native_certs::load_native_certs()
        .map_err(|e| LdapError::Transport(format!("load system CA certs: {}", e)))
}

impl AsyncRead for LdapStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            LdapStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            LdapStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for LdapStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            LdapStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            LdapStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            LdapStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            LdapStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            LdapStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            LdapStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

impl Unpin for LdapStream {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain_url() {
        assert_eq!(
            parse_ldap_url("ldap://ldap.example.com:3389").unwrap(),
            LdapUrl {
                host: "ldap.example.com".to_string(),
                port: 3389,
                use_tls: false,
            }
        );
    }

    #[test]
    fn parse_default_ports() {
        assert_eq!(parse_ldap_url("ldap://host").unwrap().port, 389);
        assert_eq!(parse_ldap_url("ldaps://host").unwrap().port, 636);
        assert!(parse_ldap_url("ldaps://host").unwrap().use_tls);
    }

    #[test]
    fn parse_rejects_bad_urls() {
        assert!(parse_ldap_url("http://host").is_err());
        assert!(parse_ldap_url("ldap://").is_err());
        assert!(parse_ldap_url("ldap://host:notaport").is_err());
    }

    #[test]
    fn parse_trailing_slash() {
        assert_eq!(parse_ldap_url("ldap://host:389/").unwrap().host, "host");
    }
}
