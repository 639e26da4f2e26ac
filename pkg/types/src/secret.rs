use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Data key of the PEM certificate chain in a TLS secret.
pub const TLS_CERT_KEY: &str = "tls.crt";

/// Data key of the PEM private key in a TLS secret.
pub const TLS_PRIVATE_KEY_KEY: &str = "tls.key";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Secret {
    pub id: String,
    pub name: String,
    pub namespace: String,
    /// Secret data stored as base64-encoded values.
    pub data: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl Secret {
    pub fn key(&self) -> String {
        crate::object_key(&self.namespace, &self.name)
    }

    /// Decode one data entry. `None` when the entry is absent.
    pub fn decoded(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        match self.data.get(key) {
            Some(raw) => Ok(Some(STANDARD.decode(raw.trim())?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_base64_entries() {
        let mut data = HashMap::new();
        data.insert(TLS_CERT_KEY.to_string(), STANDARD.encode("cert-bytes"));
        data.insert("broken".to_string(), "%%%".to_string());
        let secret = Secret {
            id: "s1".to_string(),
            name: "tls".to_string(),
            namespace: "default".to_string(),
            data,
            created_at: Utc::now(),
        };

        assert_eq!(secret.key(), "default/tls");
        assert_eq!(
            secret.decoded(TLS_CERT_KEY).unwrap(),
            Some(b"cert-bytes".to_vec())
        );
        assert_eq!(secret.decoded(TLS_PRIVATE_KEY_KEY).unwrap(), None);
        assert!(secret.decoded("broken").is_err());
    }
}
