//! TLS/SSL support for MySQL connections.
//!
//! # MySQL TLS Handshake Flow
//!
//! 1. Server sends initial handshake with `CLIENT_SSL` capability
//! 2. Client sends a short SSL request packet:
//!    - 4 bytes: capability flags (with `CLIENT_SSL`)
//!    - 4 bytes: max packet size
//!    - 1 byte: character set
//!    - 23 bytes: reserved (zeros)
//! 3. Client performs the TLS handshake over the raw socket
//! 4. Client sends the full handshake response over TLS, continuing the
//!    packet sequence where the SSL request left it
//! 5. Server sends auth result over TLS
//!
//! Certificates are verified against the webpki roots or a configured CA
//! bundle. Verification is only skipped with an explicit
//! `danger_skip_verify`.
//!
//! # Feature Flag
//!
//! The rustls stream lives behind the `tls` feature, enabled by default.

use crate::config::TlsConfig;
use crate::protocol::{PacketWriter, capabilities};
use sqlwire_core::Error;
use sqlwire_core::error::{ConfigError, ConnectionError, ConnectionErrorKind};

#[cfg(feature = "tls")]
use std::io::{Read, Write};
#[cfg(feature = "tls")]
use std::sync::Arc;

/// Size of the SSL request payload.
pub const SSL_REQUEST_SIZE: usize = 32;

/// Build the SSL request payload.
///
/// This is the first 32 bytes of a handshake response with `CLIENT_SSL`
/// set, sent in the clear before the TLS handshake starts.
pub fn build_ssl_request(client_caps: u32, max_packet_size: u32, character_set: u8) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(SSL_REQUEST_SIZE);
    writer.write_u32_le(client_caps | capabilities::CLIENT_SSL);
    writer.write_u32_le(max_packet_size);
    writer.write_u8(character_set);
    writer.write_zeros(23);
    writer.into_bytes()
}

/// Check that the TLS configuration is internally consistent.
pub fn validate_tls_config(tls_config: &TlsConfig) -> Result<(), Error> {
    match (&tls_config.client_cert_path, &tls_config.client_key_path) {
        (Some(_), None) => Err(config_error(
            "Client certificate provided without client key. \
             Both must be set for mutual TLS.",
        )),
        (None, Some(_)) => Err(config_error(
            "Client key provided without client certificate. \
             Both must be set for mutual TLS.",
        )),
        _ => Ok(()),
    }
}

fn config_error(message: &str) -> Error {
    Error::Config(ConfigError {
        message: message.to_string(),
        source: None,
    })
}

/// Create a TLS-related connection error.
pub(crate) fn tls_error(message: impl Into<String>) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Ssl,
        message: message.into(),
        source: None,
    })
}

/// TLS session over an established stream, using rustls.
#[cfg(feature = "tls")]
pub struct TlsStream<S: Read + Write> {
    conn: rustls::ClientConnection,
    stream: S,
}

#[cfg(feature = "tls")]
impl<S: Read + Write> std::fmt::Debug for TlsStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsStream")
            .field("protocol_version", &self.conn.protocol_version())
            .field("is_handshaking", &self.conn.is_handshaking())
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "tls")]
impl<S: Read + Write> TlsStream<S> {
    /// Run the TLS handshake over `stream`.
    ///
    /// `host` is used for SNI and certificate name checks unless the
    /// configuration overrides it with `server_name`.
    pub fn new(mut stream: S, tls_config: &TlsConfig, host: &str) -> Result<Self, Error> {
        validate_tls_config(tls_config)?;
        let config = client_config(tls_config)?;

        let sni = tls_config.server_name.as_deref().unwrap_or(host);
        let server_name = rustls::pki_types::ServerName::try_from(sni.to_string())
            .map_err(|e| tls_error(format!("Invalid server name '{}': {}", sni, e)))?;

        let mut conn = rustls::ClientConnection::new(Arc::new(config), server_name)
            .map_err(|e| tls_error(format!("Failed to create TLS connection: {}", e)))?;

        while conn.is_handshaking() {
            conn.complete_io(&mut stream).map_err(|e| {
                Error::Connection(ConnectionError {
                    kind: ConnectionErrorKind::Ssl,
                    message: format!("TLS handshake failed: {}", e),
                    source: Some(Box::new(e)),
                })
            })?;
        }

        Ok(TlsStream { conn, stream })
    }

    /// Get the negotiated protocol version.
    pub fn protocol_version(&self) -> Option<rustls::ProtocolVersion> {
        self.conn.protocol_version()
    }
}

#[cfg(feature = "tls")]
impl<S: Read + Write> Read for TlsStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        rustls::Stream::new(&mut self.conn, &mut self.stream).read(buf)
    }
}

#[cfg(feature = "tls")]
impl<S: Read + Write> Write for TlsStream<S> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        rustls::Stream::new(&mut self.conn, &mut self.stream).write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        rustls::Stream::new(&mut self.conn, &mut self.stream).flush()
    }
}

/// Build the rustls client configuration.
#[cfg(feature = "tls")]
fn client_config(tls_config: &TlsConfig) -> Result<rustls::ClientConfig, Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| tls_error(format!("Failed to set TLS versions: {}", e)))?;

    let builder = if tls_config.danger_skip_verify {
        tracing::warn!("TLS certificate verification is disabled");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoCertificateVerification(provider)))
    } else {
        builder.with_root_certificates(root_store(tls_config)?)
    };

    match (&tls_config.client_cert_path, &tls_config.client_key_path) {
        (Some(cert_path), Some(key_path)) => {
            let certs = load_certs(cert_path)?;
            let key = load_private_key(key_path)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| tls_error(format!("Failed to configure client auth: {}", e)))
        }
        _ => Ok(builder.with_no_client_auth()),
    }
}

/// Trust anchors: the configured CA bundle, or the webpki roots.
#[cfg(feature = "tls")]
fn root_store(tls_config: &TlsConfig) -> Result<rustls::RootCertStore, Error> {
    let mut store = rustls::RootCertStore::empty();
    match &tls_config.ca_cert_path {
        Some(path) => {
            for cert in load_certs(path)? {
                store
                    .add(cert)
                    .map_err(|e| tls_error(format!("Failed to add CA certificate: {}", e)))?;
            }
        }
        None => store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }
    Ok(store)
}

#[cfg(feature = "tls")]
fn open_pem(path: &std::path::Path) -> Result<std::io::BufReader<std::fs::File>, Error> {
    std::fs::File::open(path)
        .map(std::io::BufReader::new)
        .map_err(|e| tls_error(format!("Failed to open '{}': {}", path.display(), e)))
}

#[cfg(feature = "tls")]
fn load_certs(
    path: &std::path::Path,
) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, Error> {
    let certs = rustls_pemfile::certs(&mut open_pem(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_error(format!("Failed to parse '{}': {}", path.display(), e)))?;

    if certs.is_empty() {
        return Err(tls_error(format!(
            "No certificates found in '{}'",
            path.display()
        )));
    }
    Ok(certs)
}

#[cfg(feature = "tls")]
fn load_private_key(
    path: &std::path::Path,
) -> Result<rustls::pki_types::PrivateKeyDer<'static>, Error> {
    rustls_pemfile::private_key(&mut open_pem(path)?)
        .map_err(|e| tls_error(format!("Failed to parse '{}': {}", path.display(), e)))?
        .ok_or_else(|| tls_error(format!("No private key found in '{}'", path.display())))
}

#[cfg(feature = "tls")]
mod danger {
    use rustls::DigitallySignedStruct;
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use std::sync::Arc;

    /// Accepts any server certificate, still checking handshake signatures.
    #[derive(Debug)]
    pub(super) struct NoCertificateVerification(pub(super) Arc<CryptoProvider>);

    impl ServerCertVerifier for NoCertificateVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::charset;

    #[test]
    fn test_build_ssl_request() {
        let payload = build_ssl_request(
            capabilities::DEFAULT_CLIENT_FLAGS,
            16 * 1024 * 1024,
            charset::UTF8MB4_GENERAL_CI,
        );

        assert_eq!(payload.len(), SSL_REQUEST_SIZE);
        let caps = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        assert!(caps & capabilities::CLIENT_SSL != 0);
        assert_eq!(
            u32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]),
            16 * 1024 * 1024
        );
        assert_eq!(payload[8], charset::UTF8MB4_GENERAL_CI);
        assert!(payload[9..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_validate_tls_config_client_cert() {
        assert!(validate_tls_config(&TlsConfig::new()).is_ok());

        let config = TlsConfig::new().client_cert("/path/to/client.pem");
        match validate_tls_config(&config) {
            Err(Error::Config(e)) => assert!(e.message.contains("without client key")),
            other => panic!("unexpected: {other:?}"),
        }

        let config = TlsConfig::new().client_key("/path/to/client-key.pem");
        assert!(matches!(validate_tls_config(&config), Err(Error::Config(_))));

        let config = TlsConfig::new()
            .ca_cert("/path/to/ca.pem")
            .client_cert("/path/to/client.pem")
            .client_key("/path/to/client-key.pem");
        assert!(validate_tls_config(&config).is_ok());
    }

    #[cfg(feature = "tls")]
    #[test]
    fn test_missing_ca_file_is_ssl_error() {
        let config = TlsConfig::new().ca_cert("/nonexistent/sqlwire-ca.pem");
        match client_config(&config) {
            Err(Error::Connection(e)) => {
                assert_eq!(e.kind, ConnectionErrorKind::Ssl);
                assert!(e.message.contains("sqlwire-ca.pem"));
            }
            other => panic!("expected SSL error, got {other:?}"),
        }
    }

    #[cfg(feature = "tls")]
    #[test]
    fn test_default_config_uses_webpki_roots() {
        assert!(client_config(&TlsConfig::new()).is_ok());
        assert!(client_config(&TlsConfig::new().skip_verify(true)).is_ok());
    }
}
