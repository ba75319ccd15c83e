// TLS termination for the listener
// Uses tokio-rustls for TLS encryption

use std::fs;
use std::io::BufReader;
use std::sync::Arc;

use rustls_pemfile::{certs, pkcs8_private_keys};
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::rustls::server::WebPkiClientVerifier;

use crate::error::{Error, Result};

/// Build a TLS acceptor from PEM cert/key files; a CA file switches client
/// certificate verification on.
pub fn build_tls_acceptor(
    cert_file: &str,
    key_file: &str,
    ca_file: Option<&str>,
) -> Result<TlsAcceptor> {
    let cert_data =
        fs::read(cert_file).map_err(|e| Error::Msg(format!("failed to read cert file: {e}")))?;
    let mut cert_reader = BufReader::new(&cert_data[..]);
    let cert_chain: Vec<_> = certs(&mut cert_reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Msg(format!("failed to parse certificates: {e}")))?;
    if cert_chain.is_empty() {
        return Err(Error::Msg("no certificate found".to_string()));
    }

    let key_data =
        fs::read(key_file).map_err(|e| Error::Msg(format!("failed to read key file: {e}")))?;
    let mut key_reader = BufReader::new(&key_data[..]);
    let keys: Vec<_> = pkcs8_private_keys(&mut key_reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Msg(format!("failed to parse private key: {e}")))?;
    let Some(key) = keys.into_iter().next() else {
        return Err(Error::Msg("no private key found".to_string()));
    };
    let key = tokio_rustls::rustls::pki_types::PrivateKeyDer::from(key);

    let builder = ServerConfig::builder();
    let config = match ca_file {
        Some(ca_path) => {
            let ca_data = fs::read(ca_path)
                .map_err(|e| Error::Msg(format!("failed to read CA file: {e}")))?;
            let mut ca_reader = BufReader::new(&ca_data[..]);
            let mut roots = tokio_rustls::rustls::RootCertStore::empty();
            for cert in certs(&mut ca_reader) {
                let cert =
                    cert.map_err(|e| Error::Msg(format!("failed to parse CA cert: {e}")))?;
                roots
                    .add(cert)
                    .map_err(|e| Error::Msg(format!("failed to add CA cert: {e}")))?;
            }
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| Error::Msg(format!("failed to build client verifier: {e}")))?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(cert_chain, key)
        }
        None => builder
            .with_no_client_auth()
            .with_single_cert(cert_chain, key),
    }
    .map_err(|e| Error::Msg(format!("invalid TLS configuration: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
