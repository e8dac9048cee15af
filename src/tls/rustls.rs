//! rustls-backed [`TlsEngine`]
//!
//! rustls exposes exactly the split this layer needs: `write_tls`/`read_tls`
//! move records, `process_new_packets` advances the session, and the
//! `reader`/`writer` pair carries plaintext. Handshake crypto runs inline,
//! so this engine never reports `NeedTask`.

use std::io::{Read, Write};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::common::{Error, Result};
use crate::tls::{EngineResult, EngineStatus, HandshakeStatus, TlsEngine};

/// Client-side TLS options
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// ALPN protocols to offer, in preference order
    pub alpn: Vec<String>,
    /// Accept any server certificate
    pub allow_insecure: bool,
}

/// [`TlsEngine`] over a rustls client session
#[derive(Debug)]
pub struct RustlsEngine {
    conn: ClientConnection,
}

impl RustlsEngine {
    pub fn client(server_name: &str, options: &TlsOptions) -> Result<Box<Self>> {
        let mut root_store = RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let mut config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        if !options.alpn.is_empty() {
            config.alpn_protocols = options
                .alpn
                .iter()
                .map(|s| s.as_bytes().to_vec())
                .collect();
        }

        if options.allow_insecure {
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(InsecureVerifier));
        }

        let domain = ServerName::try_from(server_name.to_string())
            .map_err(|_| Error::Config(format!("Invalid server name: {server_name}")))?;

        let conn = ClientConnection::new(Arc::new(config), domain)
            .map_err(|e| Error::Tls(e.to_string()))?;
        Ok(Box::new(Self { conn }))
    }
}

impl TlsEngine for RustlsEngine {
    fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult> {
        let mut consumed = 0;
        if !self.conn.is_handshaking() && !src.is_empty() {
            consumed = self
                .conn
                .writer()
                .write(src)
                .map_err(|e| Error::Tls(format!("plaintext buffering failed: {e}")))?;
        }

        let mut produced = 0;
        while self.conn.wants_write() && produced < dst.len() {
            let mut sink = &mut dst[produced..];
            let n = self
                .conn
                .write_tls(&mut sink)
                .map_err(|e| Error::Tls(e.to_string()))?;
            if n == 0 {
                break;
            }
            produced += n;
        }

        let status = if self.conn.wants_write() && produced == 0 && consumed == 0 {
            EngineStatus::BufferOverflow
        } else {
            EngineStatus::Ok
        };
        Ok(EngineResult {
            status,
            consumed,
            produced,
        })
    }

    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult> {
        let mut rd: &[u8] = src;
        let mut consumed = 0;
        if !rd.is_empty() {
            // Partial records are buffered inside the session
            consumed = self
                .conn
                .read_tls(&mut rd)
                .map_err(|e| Error::Tls(e.to_string()))?;
        }

        let state = self
            .conn
            .process_new_packets()
            .map_err(|e| Error::Tls(e.to_string()))?;

        let mut produced = 0;
        if state.plaintext_bytes_to_read() > 0 {
            if dst.is_empty() {
                return Ok(EngineResult {
                    status: EngineStatus::BufferOverflow,
                    consumed,
                    produced: 0,
                });
            }
            produced = self
                .conn
                .reader()
                .read(dst)
                .map_err(|e| Error::Tls(format!("plaintext read failed: {e}")))?;
        }

        let status = if produced == 0 && state.peer_has_closed() {
            EngineStatus::Closed
        } else if produced == 0 && consumed == src.len() {
            EngineStatus::BufferUnderflow
        } else {
            EngineStatus::Ok
        };
        Ok(EngineResult {
            status,
            consumed,
            produced,
        })
    }

    fn handshake_status(&self) -> HandshakeStatus {
        if !self.conn.is_handshaking() {
            HandshakeStatus::Finished
        } else if self.conn.wants_write() {
            HandshakeStatus::NeedWrap
        } else {
            HandshakeStatus::NeedUnwrap
        }
    }

    fn application_protocol(&self) -> Option<String> {
        self.conn
            .alpn_protocol()
            .map(|p| String::from_utf8_lossy(p).into_owned())
    }

    fn initiate_close(&mut self) {
        self.conn.send_close_notify();
    }
}

/// Insecure certificate verifier for testing
#[derive(Debug)]
struct InsecureVerifier;

impl ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_client_starts_by_writing_its_hello() {
        let engine = RustlsEngine::client("example.org", &TlsOptions::default()).unwrap();
        assert_eq!(engine.handshake_status(), HandshakeStatus::NeedWrap);
        assert!(engine.application_protocol().is_none());
    }

    #[test]
    fn wrap_produces_the_client_hello_record() {
        let mut engine = RustlsEngine::client("example.org", &TlsOptions::default()).unwrap();
        let mut record = vec![0u8; crate::tls::MAX_RECORD_SIZE];
        let result = engine.wrap(&[], &mut record).unwrap();
        assert_eq!(result.status, EngineStatus::Ok);
        assert!(result.produced > 0);
        // TLS handshake record header
        assert_eq!(record[0], 0x16);
    }

    #[test]
    fn rejects_an_invalid_server_name() {
        let err = RustlsEngine::client("not a hostname", &TlsOptions::default()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
