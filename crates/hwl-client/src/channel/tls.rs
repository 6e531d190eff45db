//! Client side TLS for alternative endpoints

use std::sync::Arc;

use hwl_core::{ConnectionError, HostPort};
use hwl_protocol::AlternativeEndpoint;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

/// Connector and server name for one advertised endpoint
///
/// The endpoint's own certificate is the only trust root, and the shared
/// client identity it carries is presented for mutual authentication.
pub(crate) fn connector_for(
    endpoint: &AlternativeEndpoint,
) -> Result<(TlsConnector, ServerName<'static>), ConnectionError> {
    let tls_err = |reason: String| ConnectionError::Tls {
        address: endpoint.endpoint.clone(),
        reason,
    };

    let host_port: HostPort = endpoint
        .endpoint
        .parse()
        .map_err(|_| ConnectionError::InvalidAddress(endpoint.endpoint.clone()))?;

    let server_certs = parse_certificates(&endpoint.certificate).map_err(&tls_err)?;
    let mut roots = RootCertStore::empty();
    for cert in server_certs {
        roots
            .add(cert)
            .map_err(|e| tls_err(format!("bad server certificate: {}", e)))?;
    }

    let client_certs = parse_certificates(&endpoint.client_certificate).map_err(&tls_err)?;
    let client_key = PrivateKeyDer::from_pem_slice(endpoint.client_private_key.as_bytes())
        .map_err(|e| tls_err(format!("bad client key: {}", e)))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| tls_err(e.to_string()))?
        .with_root_certificates(roots)
        .with_client_auth_cert(client_certs, client_key)
        .map_err(|e| tls_err(format!("client identity rejected: {}", e)))?;

    let server_name = ServerName::try_from(host_port.host.clone())
        .map_err(|e| tls_err(format!("invalid server name '{}': {}", host_port.host, e)))?;

    Ok((TlsConnector::from(Arc::new(config)), server_name))
}

fn parse_certificates(pem: &str) -> Result<Vec<CertificateDer<'static>>, String> {
    let certs = CertificateDer::pem_slice_iter(pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("failed to parse certificates: {}", e))?;
    if certs.is_empty() {
        return Err("no certificates found".to_string());
    }
    Ok(certs)
}
