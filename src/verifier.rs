use std::sync::Arc;

use base64::engine::{general_purpose::STANDARD as BASE64, Engine};
use p256::ecdsa::{signature::Verifier as _, Signature};
use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;

use crate::{
    error::{Error, Result},
    fulcio::CertificateAuthority,
    rekor::TransparencyLog,
    trust::{certificate_public_key, format_unix, TrustRoot},
};

/// Where the verifier's trusted certificates come from.
#[derive(Clone)]
pub enum TrustSource {
    /// A fixed set of certificates
    Pinned(TrustRoot),
    /// The certificate authority's published trust bundle, fetched on first use
    Authority(Arc<dyn CertificateAuthority>),
}

/// Details of a signature that verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    /// Identity bound into the signing certificate
    pub identity: Option<String>,
    /// Issuer of the signing certificate
    pub issuer: String,
    /// UUID of the log entry
    pub log_uuid: String,
    /// Index of the log entry
    pub log_index: u64,
    /// Time the log integrated the entry (unix seconds)
    pub integrated_time: i64,
}

/// Checks keyless signatures against the transparency log and trust root.
pub struct Verifier {
    log: Arc<dyn TransparencyLog>,
    trust: TrustSource,
    trust_root: OnceCell<TrustRoot>,
}

impl Verifier {
    /// Creates a verifier.
    pub fn new(log: Arc<dyn TransparencyLog>, trust: TrustSource) -> Self {
        Self {
            log,
            trust,
            trust_root: OnceCell::new(),
        }
    }

    async fn trust_root(&self) -> Result<&TrustRoot> {
        match &self.trust {
            TrustSource::Pinned(root) => Ok(root),
            TrustSource::Authority(authority) => {
                self.trust_root
                    .get_or_try_init(|| async {
                        let root = authority
                            .trust_bundle()
                            .await
                            .map_err(Error::TrustRootUnavailable)?;
                        log::debug!("Loaded trust bundle with {} certificates", root.len());
                        Ok::<_, Error>(root)
                    })
                    .await
            }
        }
    }

    /// Verifies `signature` (standard base64) over `payload`.
    ///
    /// Returns the details on success. Failures that mean "this signature is
    /// not valid" surface as [`Error::LogLookup`], [`Error::CertificateTrust`]
    /// or [`Error::SignatureMismatch`].
    pub async fn verify_detailed(&self, payload: &[u8], signature: &str) -> Result<Verification> {
        let signature = BASE64
            .decode(signature.trim())
            .map_err(|e| Error::SignatureMismatch(format!("Signature is not base64: {e}")))?;
        let digest: [u8; 32] = Sha256::digest(payload).into();

        let entry = self
            .log
            .lookup_entry(&digest, &signature)
            .await
            .map_err(|e| Error::LogLookup(format!("{e:#}")))?
            .ok_or_else(|| Error::LogLookup("No log entry records this signature".to_owned()))?;

        let record = entry
            .record()
            .map_err(|e| Error::LogLookup(format!("Unreadable log entry {}: {e:#}", entry.uuid)))?;
        if record.digest != digest || record.signature != signature {
            return Err(Error::LogLookup(format!(
                "Log entry {} records a different signature",
                entry.uuid
            )));
        }

        let certificate = pem::parse(&record.certificate_pem)
            .map_err(|e| Error::CertificateTrust(format!("Logged certificate is not PEM: {e}")))?
            .into_contents();

        let trusted = self
            .trust_root()
            .await?
            .validate(&certificate, entry.integrated_time)?;

        let key = certificate_public_key(&certificate)
            .map_err(|e| Error::CertificateTrust(format!("{e:#}")))?;
        let parsed = Signature::from_der(&signature)
            .map_err(|e| Error::SignatureMismatch(format!("Signature is not ASN.1 DER: {e}")))?;
        key.verify(payload, &parsed).map_err(|_| {
            Error::SignatureMismatch("Signature does not match the payload".to_owned())
        })?;

        entry
            .verify_inclusion()
            .map_err(|e| Error::LogLookup(format!("Inclusion proof rejected: {e:#}")))?;

        Ok(Verification {
            identity: trusted.identity,
            issuer: trusted.issuer,
            log_uuid: entry.uuid,
            log_index: entry.log_index,
            integrated_time: entry.integrated_time,
        })
    }

    /// Verifies `signature` (standard base64) over `payload`.
    ///
    /// # Arguments
    ///
    /// * `payload` - The exact bytes that were signed.
    /// * `signature` - Base64 DER signature as returned by the signer.
    ///
    /// # Returns
    ///
    /// `Ok(true)` when the log records the signature, its certificate chains to
    /// the trust root at the time it was logged, and it matches `payload`.
    /// `Ok(false)` for every other signature. A log that cannot be reached also
    /// reads as `Ok(false)`, since an unconfirmed signature is not a valid one.
    ///
    /// # Errors
    ///
    /// A trust bundle that cannot be fetched from the certificate authority is
    /// [`Error::TrustRootUnavailable`]. Without it there is nothing to judge
    /// the certificate against, so no answer is given.
    pub async fn verify(&self, payload: &[u8], signature: &str) -> Result<bool> {
        match self.verify_detailed(payload, signature).await {
            Ok(verification) => {
                log::info!(
                    "Verified signature by {} logged at index {} ({})",
                    verification.identity.as_deref().unwrap_or("<unknown>"),
                    verification.log_index,
                    format_unix(verification.integrated_time)
                );
                Ok(true)
            }
            Err(e) if e.is_verification_failure() => {
                log::debug!("Signature rejected: {e}");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}
