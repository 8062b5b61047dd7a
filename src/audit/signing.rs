// ABOUTME: HMAC-SHA256 signatures over audit records
// ABOUTME: Signs the canonical payload plus checksum; key is read from an environment variable

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::entity::AuditLogEntity;
use crate::error::IntegrityError;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct RecordSigner {
    key: Vec<u8>,
}

impl std::fmt::Debug for RecordSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordSigner").field("key", &"***").finish()
    }
}

impl RecordSigner {
    pub fn new(key: impl Into<Vec<u8>>) -> Result<Self> {
        let key = key.into();
        if key.is_empty() {
            bail!("signing key is empty");
        }
        Ok(Self { key })
    }

    /// Read the key from `var`. An unset variable means signing is off.
    pub fn from_env(var: &str) -> Result<Option<Self>> {
        match std::env::var(var) {
            Ok(value) => Self::new(value.into_bytes())
                .with_context(|| format!("invalid signing key in {}", var))
                .map(Some),
            Err(std::env::VarError::NotPresent) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", var)),
        }
    }

    pub fn sign(&self, record: &AuditLogEntity) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(&self.key).context("invalid HMAC key")?;
        mac.update(signed_bytes(record).as_bytes());
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }

    pub fn verify(&self, record: &AuditLogEntity) -> Result<(), IntegrityError> {
        verify_signature(record, &self.key)
    }
}

fn signed_bytes(record: &AuditLogEntity) -> String {
    format!("{}|{}", record.canonical_payload(), record.checksum)
}

/// Check `record.signature` against `key`. Unsigned records fail.
pub fn verify_signature(record: &AuditLogEntity, key: &[u8]) -> Result<(), IntegrityError> {
    let mismatch = || IntegrityError::SignatureMismatch(record.id.to_string());
    let signature = record.signature.as_deref().ok_or_else(mismatch)?;
    let expected = STANDARD.decode(signature).map_err(|_| mismatch())?;
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| mismatch())?;
    mac.update(signed_bytes(record).as_bytes());
    mac.verify_slice(&expected).map_err(|_| mismatch())
}
