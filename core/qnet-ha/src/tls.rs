//! Mutually authenticated HTTPS client construction

use std::path::Path;
use std::time::Duration;

use reqwest::{Certificate, Client, Identity};

use crate::config::TlsConfig;
use crate::errors::{HaError, HaResult};

fn read_pem(path: &Path, what: &str) -> HaResult<Vec<u8>> {
    std::fs::read(path).map_err(|e| HaError::Tls(format!("failed to read {} {}: {}", what, path.display(), e)))
}

/// Build a client that trusts the configured CA bundle and presents the
/// configured client identity. Without TLS material the system roots are used.
pub fn build_client(tls: &TlsConfig, timeout: Duration) -> HaResult<Client> {
    let mut builder = Client::builder().use_rustls_tls().timeout(timeout);

    if let Some(ca) = tls.ca_bundle.as_deref() {
        let pem = read_pem(ca, "CA bundle")?;
        let certificate = Certificate::from_pem(&pem)
            .map_err(|e| HaError::Tls(format!("failed to parse CA bundle: {}", e)))?;
        builder = builder.add_root_certificate(certificate).tls_built_in_root_certs(false);
    }

    match (tls.client_cert.as_deref(), tls.client_key.as_deref()) {
        (Some(cert), Some(key)) => {
            let mut identity_bytes = read_pem(cert, "client certificate")?;
            identity_bytes.extend_from_slice(&read_pem(key, "client key")?);
            let identity = Identity::from_pem(&identity_bytes)
                .map_err(|e| HaError::Tls(format!("failed to parse client identity: {}", e)))?;
            builder = builder.identity(identity);
        }
        (None, None) => {}
        _ => {
            return Err(HaError::Tls(
                "client_cert and client_key must be configured together".into(),
            ))
        }
    }

    builder
        .build()
        .map_err(|e| HaError::Tls(format!("failed to build HTTPS client: {}", e)))
}
