use std::sync::Arc;

use anyhow::anyhow;
use base64::engine::{general_purpose::STANDARD as BASE64, Engine};
use p256::{
    ecdsa::{signature::Signer as _, DerSignature, SigningKey, VerifyingKey},
    elliptic_curve::rand_core::OsRng,
    pkcs8::{EncodePublicKey, LineEnding},
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    error::{Error, Result},
    fulcio::{CertificateAuthority, EphemeralCertificate},
    identity::{IdentityProvider, IdentityToken},
    rekor::{LogEntry, TransparencyLog},
    trust::certificate_public_key,
};

/// How a failed transparency log submission affects signing.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum LogPolicy {
    /// Submission failure fails the signing call
    #[default]
    Required,
    /// Submission failure is logged and the signature is returned unlogged
    BestEffort,
}

/// Result of a keyless signing operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedPayload {
    /// ASN.1 DER ECDSA P-256 signature
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
    /// Certificate binding the signing key to the signer identity
    pub certificate: EphemeralCertificate,
    /// Transparency log record, absent only for unlogged best-effort signatures
    pub log_entry: Option<LogEntry>,
}

impl SignedPayload {
    /// Standard base64 text of the signature.
    pub fn base64_signature(&self) -> String {
        BASE64.encode(&self.signature)
    }
}

mod base64_bytes {
    use base64::engine::{general_purpose::STANDARD as BASE64, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        BASE64.decode(s).map_err(serde::de::Error::custom)
    }
}

/// Signing key that lives for a single signing call.
///
/// The secret scalar is zeroized when the key is dropped.
pub struct EphemeralKey {
    signing_key: SigningKey,
}

impl EphemeralKey {
    /// Generates a fresh ECDSA P-256 key.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::random(&mut OsRng),
        }
    }

    /// Public half of the key.
    pub fn verifying_key(&self) -> &VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// SPKI PEM encoding of the public key.
    pub fn public_key_pem(&self) -> Result<String> {
        self.verifying_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| Error::Crypto(format!("Failed to encode public key: {e}")))
    }

    /// Signs `data` with SHA-256, returning an ASN.1 DER signature.
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        let signature: DerSignature = self.signing_key.sign(data);
        signature.as_bytes().to_vec()
    }
}

/// Keyless signer: identity token in, certificate-backed logged signature out.
///
/// Holds no per-call state, so one signer serves concurrent calls.
#[derive(Clone)]
pub struct Signer {
    identity: Arc<dyn IdentityProvider>,
    authority: Arc<dyn CertificateAuthority>,
    log: Arc<dyn TransparencyLog>,
    log_policy: LogPolicy,
}

impl Signer {
    /// Creates a signer that requires every signature to be logged.
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        authority: Arc<dyn CertificateAuthority>,
        log: Arc<dyn TransparencyLog>,
    ) -> Self {
        Self {
            identity,
            authority,
            log,
            log_policy: LogPolicy::default(),
        }
    }

    /// Sets the transparency log policy.
    pub fn with_log_policy(mut self, log_policy: LogPolicy) -> Self {
        self.log_policy = log_policy;
        self
    }

    /// The configured transparency log policy.
    pub fn log_policy(&self) -> LogPolicy {
        self.log_policy
    }

    /// Signs `payload` with a fresh ephemeral key.
    ///
    /// # Arguments
    ///
    /// * `payload` - Bytes to sign.
    /// * `identity_token` - OIDC token to certify the key with. When `None` a
    ///   token is obtained from the configured identity provider.
    ///
    /// # Returns
    ///
    /// The DER signature, the certificate binding the ephemeral key to the
    /// token's identity, and the log entry recording both. The entry is `None`
    /// only under [`LogPolicy::BestEffort`] when submission failed.
    pub async fn sign(
        &self,
        payload: &[u8],
        identity_token: Option<IdentityToken>,
    ) -> Result<SignedPayload> {
        let identity_token = match identity_token {
            Some(token) => token,
            None => self
                .identity
                .obtain_token()
                .await
                .map_err(Error::Identity)?,
        };
        let subject = identity_token.subject().map_err(Error::Identity)?;

        let key = EphemeralKey::generate();

        let proof_of_possession = key.sign(subject.as_bytes());
        let public_key_pem = key.public_key_pem()?;

        let certificate = self
            .authority
            .request_certificate(&identity_token, &public_key_pem, &proof_of_possession)
            .await
            .map_err(Error::CertificateIssuance)?;
        ensure_binds_key(&certificate, key.verifying_key())?;
        log::info!(
            "Certificate issued for {subject} with {} certs in chain",
            certificate.chain.len()
        );

        let signature = key.sign(payload);
        drop(key);

        let digest: [u8; 32] = Sha256::digest(payload).into();

        let submitted = self
            .log
            .submit_entry(&digest, &signature, &certificate)
            .await
            .and_then(|entry| {
                ensure_records(&entry, &digest, &signature, &certificate)?;
                Ok(entry)
            });

        let log_entry = match submitted {
            Ok(entry) => {
                log::info!(
                    "Signature recorded at log index {} ({})",
                    entry.log_index,
                    entry.uuid
                );
                Some(entry)
            }
            Err(e) => match self.log_policy {
                LogPolicy::Required => return Err(Error::LogSubmission(e)),
                LogPolicy::BestEffort => {
                    log::warn!("Signature was not recorded in the transparency log: {e:#}");
                    None
                }
            },
        };

        Ok(SignedPayload {
            signature,
            certificate,
            log_entry,
        })
    }
}

fn ensure_binds_key(certificate: &EphemeralCertificate, expected: &VerifyingKey) -> Result<()> {
    let leaf = certificate.leaf_der().map_err(Error::CertificateIssuance)?;
    let issued = certificate_public_key(&leaf).map_err(Error::CertificateIssuance)?;

    if &issued != expected {
        return Err(Error::CertificateIssuance(anyhow!(
            "Issued certificate does not carry the requested public key"
        )));
    }

    Ok(())
}

/// Checks that the log answered with the entry that was submitted.
fn ensure_records(
    entry: &LogEntry,
    digest: &[u8; 32],
    signature: &[u8],
    certificate: &EphemeralCertificate,
) -> anyhow::Result<()> {
    let record = entry.record()?;

    if &record.digest != digest
        || record.signature != signature
        || record.certificate_pem.trim() != certificate.leaf_pem.trim()
    {
        return Err(anyhow!(
            "Log entry {} does not match the submitted signature",
            entry.uuid
        ));
    }

    Ok(())
}
