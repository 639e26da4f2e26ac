use anyhow::Context;
use chrono::{DateTime, Utc};
use rcgen::KeyPair;
use x509_parser::extensions::GeneralName;

use pkg_types::error::GatewayError;
use pkg_types::secret::{Secret, TLS_CERT_KEY, TLS_PRIVATE_KEY_KEY};

use crate::model::SslCert;

/// Parse the `tls.crt` / `tls.key` pair of a secret.
///
/// Fails with a validation error when either half is missing, unparsable,
/// or the key does not belong to the leaf certificate. Expired certificates
/// are accepted; callers warn about them.
pub fn parse_certificate(secret: &Secret) -> anyhow::Result<SslCert> {
    let cert_pem = secret
        .decoded(TLS_CERT_KEY)
        .context("decoding tls.crt")?
        .ok_or_else(|| GatewayError::Validation(format!("secret {} has no tls.crt", secret.key())))?;
    let key_pem = secret
        .decoded(TLS_PRIVATE_KEY_KEY)
        .context("decoding tls.key")?
        .ok_or_else(|| GatewayError::Validation(format!("secret {} has no tls.key", secret.key())))?;

    let leaf = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .next()
        .ok_or_else(|| GatewayError::Validation(format!("secret {} has no certificate", secret.key())))?
        .context("reading certificate PEM")?;

    let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref())
        .map_err(|e| GatewayError::Validation(format!("invalid certificate: {}", e)))?;

    let mut common_names: Vec<String> = cert
        .subject()
        .iter_common_name()
        .filter_map(|cn| cn.as_str().ok())
        .map(str::to_string)
        .collect();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            if let GeneralName::DNSName(dns) = name {
                if !common_names.iter().any(|n| n == dns) {
                    common_names.push(dns.to_string());
                }
            }
        }
    }

    let expires_at = DateTime::<Utc>::from_timestamp(cert.validity().not_after.timestamp(), 0)
        .ok_or_else(|| GatewayError::Validation("certificate expiry out of range".to_string()))?;

    let key_text = String::from_utf8(key_pem)
        .map_err(|_| GatewayError::Validation("tls.key is not UTF-8 PEM".to_string()))?;
    let key_pair = KeyPair::from_pem(&key_text)
        .map_err(|e| GatewayError::Validation(format!("invalid private key: {}", e)))?;
    if key_pair.public_key_raw() != cert.public_key().subject_public_key.data.as_ref() {
        return Err(GatewayError::Validation(format!(
            "private key of secret {} does not match its certificate",
            secret.key()
        ))
        .into());
    }

    let certificate_pem = String::from_utf8(cert_pem)
        .map_err(|_| GatewayError::Validation("tls.crt is not UTF-8 PEM".to_string()))?;

    Ok(SslCert {
        namespace: secret.namespace.clone(),
        name: secret.name.clone(),
        certificate_pem,
        private_key_pem: key_text,
        common_names,
        expires_at,
    })
}
