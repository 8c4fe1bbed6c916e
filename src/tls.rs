//! The `TlsEnv` collaborator: process-wide TLS material loading,
//! narrowed here to a per-[`Chirp`](crate::chirp::Chirp) config builder.
//!
//! TLS library init/cleanup itself (`rustls` needs none — unlike the
//! OpenSSL-backed C core, there is no global `SSL_library_init`) is a
//! non-event; what remains of the collaborator is turning the
//! configured PEM paths into a `rustls` client/server config pinned to
//! TLS 1.2, mandatory peer verification, and the restricted cipher
//! list spec.md §6 asks for.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::{
    AllowAnyAuthenticatedClient, Certificate, ClientConfig, PrivateKey, ProtocolVersion,
    RootCertStore, ServerConfig,
};

use crate::error::{ChirpError, Result};

/// The two AES-256-GCM suites `rustls` actually offers (no DHE suites
/// exist in `rustls` — see DESIGN.md's resolution of the cipher-list
/// Open Question).
fn allowed_ciphersuites() -> Vec<&'static rustls::SupportedCipherSuite> {
    rustls::ALL_CIPHERSUITES
        .iter()
        .copied()
        .filter(|s| {
            s.suite == rustls::CipherSuite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384
                || s.suite == rustls::CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384
        })
        .collect()
}

fn load_certs(path: &Path) -> Result<Vec<Certificate>> {
    let f = File::open(path).map_err(|e| ChirpError::TlsError(e.to_string()))?;
    let mut reader = BufReader::new(f);
    rustls::internal::pemfile::certs(&mut reader)
        .map_err(|_| ChirpError::TlsError(format!("no certificates found in {}", path.display())))
}

fn load_private_key(path: &Path) -> Result<PrivateKey> {
    let f = File::open(path).map_err(|e| ChirpError::TlsError(e.to_string()))?;
    let mut reader = BufReader::new(f);
    let mut keys = rustls::internal::pemfile::pkcs8_private_keys(&mut reader)
        .map_err(|_| ChirpError::TlsError(format!("no private key found in {}", path.display())))?;
    keys.pop()
        .ok_or_else(|| ChirpError::TlsError(format!("no private key found in {}", path.display())))
}

/// Build the `rustls` configs used for the lifetime of one `Chirp`
/// instance. `cert_chain_pem` carries both the certificate chain and,
/// for the server config's mutual-TLS requirement, the trust roots
/// peers are verified against; `dh_params_pem` holds the private key
/// in the layout the original DH-parameters slot is repurposed for
/// (see DESIGN.md).
pub struct TlsEnv {
    pub server: Arc<ServerConfig>,
    pub client: Arc<ClientConfig>,
}

impl TlsEnv {
    pub fn load(cert_chain_pem: &Path, dh_params_pem: &Path) -> Result<TlsEnv> {
        let certs = load_certs(cert_chain_pem)?;
        let key = load_private_key(dh_params_pem)?;

        let mut roots = RootCertStore::empty();
        for cert in &certs {
            let _ = roots.add(cert);
        }

        let mut server = ServerConfig::new(AllowAnyAuthenticatedClient::new(roots.clone()));
        server
            .set_single_cert(certs.clone(), key.clone())
            .map_err(|e| ChirpError::TlsError(e.to_string()))?;
        server.versions = vec![ProtocolVersion::TLSv1_2];
        server.ciphersuites = allowed_ciphersuites();

        let mut client = ClientConfig::new();
        client.root_store = roots;
        client.versions = vec![ProtocolVersion::TLSv1_2];
        client.ciphersuites = allowed_ciphersuites();
        // Peer verification is mandatory in both directions (spec
        // §6 "FAIL_IF_NO_PEER_CERT"); the client side authenticates
        // itself with the same certificate/key pair.
        client.set_single_client_cert(certs, key);

        Ok(TlsEnv {
            server: Arc::new(server),
            client: Arc::new(client),
        })
    }
}
