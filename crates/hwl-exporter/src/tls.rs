//! Credentials for alternative TLS endpoints
//!
//! An exporter can listen on extra `host:port` endpoints that clients dial
//! directly over mutually authenticated TLS. All endpoints of one server
//! share one server identity whose certificate lists every host as a
//! subject alternative name, and one client identity handed to every client
//! in the report. Both are self-signed, valid for a year and only ever held
//! in memory.

use std::sync::Arc;

use rcgen::{
    CertificateParams, Ia5String, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;
use zeroize::Zeroizing;

use hwl_core::HostPort;
use hwl_protocol::AlternativeEndpoint;

use crate::error::TlsError;

/// Validity of generated certificates
pub const CERT_VALIDITY_DAYS: i64 = 365;

/// Server and client identities for one exporter's alternative endpoints
pub struct EndpointCredentials {
    certificate_pem: String,
    client_certificate_pem: String,
    client_private_key_pem: Zeroizing<String>,
    server_config: Arc<ServerConfig>,
}

impl EndpointCredentials {
    /// Generate identities valid for every host in `endpoints`
    pub fn generate(endpoints: &[HostPort]) -> Result<Self, TlsError> {
        let sans = endpoints
            .iter()
            .map(|endpoint| san_for(&endpoint.host))
            .collect::<Result<Vec<_>, _>>()?;

        let (certificate_pem, server_key_pem) = self_signed(
            "hwlink exporter",
            sans,
            vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment],
            ExtendedKeyUsagePurpose::ServerAuth,
        )?;
        let (client_certificate_pem, client_private_key_pem) = self_signed(
            "hwlink client",
            Vec::new(),
            vec![KeyUsagePurpose::DigitalSignature],
            ExtendedKeyUsagePurpose::ClientAuth,
        )?;

        let server_config =
            server_config(&certificate_pem, &server_key_pem, &client_certificate_pem)?;

        tracing::debug!(
            "Generated alternative endpoint identities for {} hosts",
            endpoints.len()
        );
        Ok(Self {
            certificate_pem,
            client_certificate_pem,
            client_private_key_pem,
            server_config: Arc::new(server_config),
        })
    }

    /// PEM server certificate
    pub fn certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    /// PEM client certificate shared by all clients
    pub fn client_certificate_pem(&self) -> &str {
        &self.client_certificate_pem
    }

    /// Acceptor requiring the shared client identity
    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(Arc::clone(&self.server_config))
    }

    /// Report entry for a listener bound at `endpoint`
    pub fn advertise(&self, endpoint: &HostPort) -> AlternativeEndpoint {
        AlternativeEndpoint {
            endpoint: endpoint.to_string(),
            certificate: self.certificate_pem.clone(),
            client_certificate: self.client_certificate_pem.clone(),
            client_private_key: self.client_private_key_pem.as_str().to_string(),
        }
    }
}

impl std::fmt::Debug for EndpointCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointCredentials").finish_non_exhaustive()
    }
}

/// Parse configured `host:port` endpoints
pub fn parse_endpoints(endpoints: &[String]) -> Result<Vec<HostPort>, TlsError> {
    endpoints
        .iter()
        .map(|endpoint| {
            endpoint
                .parse::<HostPort>()
                .map_err(|_| TlsError::InvalidEndpoint(endpoint.clone()))
        })
        .collect()
}

/// SAN entry for `host`: an IP entry for addresses, a DNS entry otherwise
fn san_for(host: &str) -> Result<SanType, TlsError> {
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return Ok(SanType::IpAddress(ip));
    }
    Ia5String::try_from(host.to_string())
        .map(SanType::DnsName)
        .map_err(|e| TlsError::InvalidDnsName {
            host: host.to_string(),
            reason: e.to_string(),
        })
}

fn self_signed(
    common_name: &str,
    sans: Vec<SanType>,
    key_usages: Vec<KeyUsagePurpose>,
    purpose: ExtendedKeyUsagePurpose,
) -> Result<(String, Zeroizing<String>), TlsError> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String("hwlink".to_string()),
    );
    params.distinguished_name = dn;
    params.is_ca = IsCa::NoCa;
    params.key_usages = key_usages;
    params.extended_key_usages = vec![purpose];
    params.subject_alt_names = sans;

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(CERT_VALIDITY_DAYS);

    let key_pair = KeyPair::generate().map_err(|e| TlsError::KeyGeneration(e.to_string()))?;
    let key_pem = Zeroizing::new(key_pair.serialize_pem());

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| TlsError::Certificate(format!("{}: {}", common_name, e)))?;

    Ok((cert.pem(), key_pem))
}

fn server_config(
    certificate_pem: &str,
    key_pem: &str,
    client_certificate_pem: &str,
) -> Result<ServerConfig, TlsError> {
    let certificate = CertificateDer::from_pem_slice(certificate_pem.as_bytes())
        .map_err(|e| TlsError::Certificate(e.to_string()))?;
    let key = PrivateKeyDer::from_pem_slice(key_pem.as_bytes())
        .map_err(|e| TlsError::KeyGeneration(e.to_string()))?;
    let client_certificate = CertificateDer::from_pem_slice(client_certificate_pem.as_bytes())
        .map_err(|e| TlsError::Certificate(e.to_string()))?;

    let mut roots = RootCertStore::empty();
    roots
        .add(client_certificate)
        .map_err(|e| TlsError::Config(format!("client trust root rejected: {}", e)))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider))
        .build()
        .map_err(|e| TlsError::Config(e.to_string()))?;

    ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| TlsError::Config(e.to_string()))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(vec![certificate], key)
        .map_err(|e| TlsError::Config(e.to_string()))
}
