//! Byte transports: TLS with ALPN `h2`, or cleartext h2c.

use std::sync::Arc;

use rustls::RootCertStore;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::config::{ClientConfig, Scheme};
use crate::error::TransportError;

const ALPN_H2: &[u8] = b"h2";

/// A connected byte stream the HTTP/2 driver can own.
pub(crate) trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

/// Open the TCP connection and, for https, complete the TLS handshake.
pub(crate) async fn connect(config: &ClientConfig) -> Result<Box<dyn Io>, TransportError> {
    let fail = |reason: String| TransportError::Connect {
        authority: config.authority.clone(),
        reason,
    };
    let port = config
        .port()
        .ok_or_else(|| fail("invalid port".into()))?;

    let tcp = TcpStream::connect((config.host(), port))
        .await
        .map_err(|e| fail(e.to_string()))?;
    tcp.set_nodelay(true)?;

    match config.scheme {
        Scheme::Http => Ok(Box::new(tcp)),
        Scheme::Https => {
            let connector = TlsConnector::from(tls_config(config)?);
            let server_name = ServerName::try_from(config.tls_server_name().to_string())
                .map_err(|e| fail(format!("invalid server name: {e}")))?;
            let tls = connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| fail(format!("TLS handshake: {e}")))?;
            if tls.get_ref().1.alpn_protocol() != Some(ALPN_H2) {
                return Err(TransportError::AlpnMismatch);
            }
            Ok(Box::new(tls))
        }
    }
}

/// rustls client config trusting the webpki roots plus any configured extras,
/// offering only `h2`.
fn tls_config(config: &ClientConfig) -> Result<Arc<rustls::ClientConfig>, TransportError> {
    let fail = |reason: String| TransportError::Connect {
        authority: config.authority.clone(),
        reason,
    };

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    for cert in &config.extra_roots {
        roots
            .add(cert.clone())
            .map_err(|e| fail(format!("bad root certificate: {e}")))?;
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut tls = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| fail(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    tls.alpn_protocols = vec![ALPN_H2.to_vec()];
    Ok(Arc::new(tls))
}
