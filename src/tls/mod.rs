//! TLS integration.
//!
//! The crate speaks TLS through rustls: minimum protocol version 1.2, AEAD
//! cipher suites only, server-side cipher order enforced by the library.
//! Hostname verification runs against the `ServerName` the client dials (or
//! the expected hostname configured on the client), and clients that pin a
//! certificate can verify a SHA-256 fingerprint instead of a chain.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{
    ring, verify_tls12_signature, verify_tls13_signature, CryptoProvider,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::{
    ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme,
};

pub use tokio_rustls::rustls;

use crate::error::Error;

/// Builds a server-side TLS configuration from a certificate chain and its
/// private key.
pub fn server_config(
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> crate::Result<Arc<ServerConfig>> {
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(Error::new_tls)?;
    Ok(Arc::new(config))
}

/// Builds a client-side TLS configuration trusting the given roots.
pub fn client_config(roots: RootCertStore) -> Arc<ClientConfig> {
    Arc::new(
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

/// Builds a client-side TLS configuration that pins the server certificate:
/// the presented end-entity certificate must hash (SHA-256) to the given
/// 64-character lowercase hex fingerprint.
pub fn client_config_pinned(fingerprint: &str) -> crate::Result<Arc<ClientConfig>> {
    let expected = parse_fingerprint(fingerprint)?;
    let verifier = FingerprintVerifier {
        expected,
        provider: ring::default_provider().into(),
    };
    Ok(Arc::new(
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth(),
    ))
}

/// Reads a PEM certificate chain.
pub fn load_certs(path: &Path) -> crate::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(Error::new_io)?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(Error::new_io)
}

/// Reads the first PEM private key.
pub fn load_private_key(path: &Path) -> crate::Result<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(Error::new_io)?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(Error::new_io)?
        .ok_or_else(|| Error::new_tls("no private key found in file"))
}

/// Computes the lowercase-hex SHA-256 fingerprint of a DER certificate, in
/// the format [`client_config_pinned`] accepts.
pub fn certificate_fingerprint(cert: &CertificateDer<'_>) -> String {
    let digest = Sha256::digest(cert.as_ref());
    let mut out = String::with_capacity(64);
    for b in digest {
        out.push(char::from_digit((b >> 4) as u32, 16).expect("nibble"));
        out.push(char::from_digit((b & 0xf) as u32, 16).expect("nibble"));
    }
    out
}

fn parse_fingerprint(s: &str) -> crate::Result<[u8; 32]> {
    let b = s.as_bytes();
    if b.len() != 64 {
        return Err(Error::new_tls("fingerprint must be 64 hex characters"));
    }
    let mut out = [0u8; 32];
    for (i, pair) in b.chunks(2).enumerate() {
        let nibble = |c: u8| -> crate::Result<u8> {
            match c {
                b'0'..=b'9' => Ok(c - b'0'),
                b'a'..=b'f' => Ok(c - b'a' + 10),
                _ => Err(Error::new_tls("fingerprint must be lowercase hex")),
            }
        };
        out[i] = (nibble(pair[0])? << 4) | nibble(pair[1])?;
    }
    Ok(out)
}

#[derive(Debug)]
struct FingerprintVerifier {
    expected: [u8; 32],
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for FingerprintVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let digest = Sha256::digest(end_entity.as_ref());
        if digest.as_slice() == self.expected {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_parsing_is_strict() {
        let fp = "a".repeat(64);
        assert!(parse_fingerprint(&fp).is_ok());
        assert!(parse_fingerprint(&fp[..63]).is_err());
        assert!(parse_fingerprint(&"A".repeat(64)).is_err());
        assert!(parse_fingerprint(&"g".repeat(64)).is_err());
    }

    #[test]
    fn fingerprint_round_trips() {
        let cert = CertificateDer::from(b"not really der, but hashable".to_vec());
        let fp = certificate_fingerprint(&cert);
        assert_eq!(fp.len(), 64);
        assert_eq!(parse_fingerprint(&fp).unwrap().as_slice(), Sha256::digest(cert.as_ref()).as_slice());
    }
}
