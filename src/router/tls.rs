//! TLS material for the primary listener.

use std::io::BufReader;
use std::sync::{Arc, OnceLock};

use rustls::pki_types::CertificateDer;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use x509_parser::extensions::GeneralName;

use crate::error::GatewayError;
use crate::store::Certificate;

/// Selects a certificate by SNI: exact name, then wildcard, then the first.
#[derive(Debug)]
pub struct CertificateResolver {
    entries: Vec<(Vec<String>, Arc<CertifiedKey>)>,
}

impl CertificateResolver {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Certificate chosen for `server_name`.
    pub fn select(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        if let Some(name) = server_name.map(str::to_ascii_lowercase) {
            let exact = self
                .entries
                .iter()
                .find(|(names, _)| names.iter().any(|n| *n == name));
            if let Some((_, key)) = exact {
                return Some(Arc::clone(key));
            }

            if let Some((_, parent)) = name.split_once('.') {
                let wildcard = format!("*.{}", parent);
                let matched = self
                    .entries
                    .iter()
                    .find(|(names, _)| names.iter().any(|n| *n == wildcard));
                if let Some((_, key)) = matched {
                    return Some(Arc::clone(key));
                }
            }
        }

        self.entries.first().map(|(_, key)| Arc::clone(key))
    }
}

impl ResolvesServerCert for CertificateResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.select(client_hello.server_name())
    }
}

/// Build a resolver from stored certificates. Certificates that fail to parse
/// are logged and skipped; when none load, `fallback` is used.
pub fn build_resolver(
    certificates: &[Certificate],
    fallback: &SelfCertificate,
) -> Result<CertificateResolver, GatewayError> {
    let mut entries = Vec::new();

    for cert in certificates {
        match load(cert) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                tracing::error!(
                    certificate_id = %cert.id,
                    error = %e,
                    "Web server certificate error"
                );
            }
        }
    }

    if entries.is_empty() {
        let own = fallback.get()?;
        entries.push(load(&own)?);
        tracing::info!("Using self-generated certificate");
    }

    Ok(CertificateResolver { entries })
}

/// Rustls server configuration offering TLS 1.2 and 1.3, h2 and http/1.1.
pub fn server_config(resolver: CertificateResolver) -> Result<Arc<ServerConfig>, GatewayError> {
    let mut config = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_cert_resolver(Arc::new(resolver));

    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

fn load(cert: &Certificate) -> Result<(Vec<String>, Arc<CertifiedKey>), GatewayError> {
    let chain = rustls_pemfile::certs(&mut BufReader::new(cert.certificate.as_bytes()))
        .collect::<Result<Vec<_>, _>>()?;
    let leaf = chain
        .first()
        .ok_or_else(|| GatewayError::Certificate("no certificate in PEM".into()))?;
    let names = names(leaf)?;

    let key = rustls_pemfile::private_key(&mut BufReader::new(cert.key.as_bytes()))?
        .ok_or_else(|| GatewayError::Certificate("no private key in PEM".into()))?;
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)?;

    let certified = CertifiedKey::new(chain, signing_key);
    certified
        .keys_match()
        .map_err(|_| GatewayError::Certificate("certificate and private key do not match".into()))?;
    Ok((names, Arc::new(certified)))
}

/// DNS names of a certificate: subject alternative names, then common names.
fn names(der: &CertificateDer<'_>) -> Result<Vec<String>, GatewayError> {
    let (_, parsed) = x509_parser::parse_x509_certificate(der.as_ref())
        .map_err(|e| GatewayError::Certificate(format!("parse failed: {e}")))?;

    let mut names = Vec::new();
    if let Ok(Some(san)) = parsed.subject_alternative_name() {
        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                names.push(dns.to_ascii_lowercase());
            }
        }
    }
    for cn in parsed.subject().iter_common_name() {
        if let Ok(cn) = cn.as_str() {
            let cn = cn.to_ascii_lowercase();
            if !names.contains(&cn) {
                names.push(cn);
            }
        }
    }
    Ok(names)
}

/// Self-signed certificate generated on first use and kept for the lifetime
/// of the owner.
#[derive(Default)]
pub struct SelfCertificate {
    cell: OnceLock<Certificate>,
}

impl SelfCertificate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Result<Certificate, GatewayError> {
        if let Some(cert) = self.cell.get() {
            return Ok(cert.clone());
        }

        let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
            .map_err(|e| GatewayError::Certificate(format!("self certificate: {e}")))?;
        let cert = Certificate {
            id: "self".into(),
            name: "self".into(),
            certificate: generated.cert.pem(),
            key: generated.key_pair.serialize_pem(),
        };

        Ok(self.cell.get_or_init(|| cert).clone())
    }
}
