use anyhow::anyhow;
use p256::{ecdsa::VerifyingKey, pkcs8::DecodePublicKey};
use x509_parser::{certificate::X509Certificate, extensions::GeneralName, prelude::FromDer};

use crate::error::{Error, Result};

/// Longest issuer path walked from a leaf to an anchor.
const MAX_PATH_LENGTH: usize = 8;

/// Certificates accepted as issuers of ephemeral signing certificates.
///
/// Self-signed certificates in the bundle are trust anchors. The rest are
/// intermediates, used only to build a path from a leaf up to an anchor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustRoot {
    anchors: Vec<Vec<u8>>,
    intermediates: Vec<Vec<u8>>,
}

/// Facts about a signing certificate that passed path validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustedCertificate {
    /// Identity from the subject alternative name (email or URI), if any
    pub identity: Option<String>,
    /// Issuer distinguished name
    pub issuer: String,
    /// Start of the validity window (unix seconds)
    pub not_before: i64,
    /// End of the validity window (unix seconds)
    pub not_after: i64,
}

impl TrustRoot {
    /// Builds a trust root from DER certificates.
    ///
    /// At least one certificate must be self-signed.
    pub fn from_der(certificates: Vec<Vec<u8>>) -> Result<Self> {
        let mut anchors = Vec::new();
        let mut intermediates = Vec::new();

        for der in certificates {
            let (_, cert) = X509Certificate::from_der(&der)
                .map_err(|e| Error::Config(anyhow!("Invalid trust root certificate: {e}")))?;
            let self_signed = cert.subject().as_raw() == cert.issuer().as_raw();

            if self_signed {
                anchors.push(der);
            } else {
                intermediates.push(der);
            }
        }

        if anchors.is_empty() {
            return Err(Error::Config(anyhow!(
                "Trust root contains no self-signed certificate"
            )));
        }

        Ok(Self {
            anchors,
            intermediates,
        })
    }

    /// Builds a trust root from PEM text. Each item may hold several certificates.
    pub fn from_pems<'a>(pems: impl IntoIterator<Item = &'a str>) -> anyhow::Result<Self> {
        let mut certificates = Vec::new();
        for text in pems {
            let blocks = pem::parse_many(text)
                .map_err(|e| anyhow!("Failed to parse trust root PEM: {e}"))?;
            certificates.extend(blocks.into_iter().map(pem::Pem::into_contents));
        }

        if certificates.is_empty() {
            return Err(anyhow!("Trust root contains no certificates"));
        }

        Self::from_der(certificates).map_err(|e| anyhow!("{e}"))
    }

    /// Number of certificates, anchors and intermediates together.
    pub fn len(&self) -> usize {
        self.anchors.len() + self.intermediates.len()
    }

    /// Whether the trust root is empty.
    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty() && self.intermediates.is_empty()
    }

    /// Validates `leaf_der` against this trust root at unix time `at`.
    ///
    /// Same as [`TrustRoot::validate_chain`] with no intermediates beyond the
    /// ones in the bundle.
    pub fn validate(&self, leaf_der: &[u8], at: i64) -> Result<TrustedCertificate> {
        self.validate_chain(leaf_der, &[], at)
    }

    /// Validates `leaf_der` at unix time `at`, building a path to an anchor.
    ///
    /// # Arguments
    ///
    /// * `leaf_der` - DER signing certificate.
    /// * `chain_der` - Extra DER intermediates, such as the chain returned with an
    ///   [`EphemeralCertificate`](crate::fulcio::EphemeralCertificate). They are
    ///   used for path building only and are never trusted on their own.
    /// * `at` - Unix time the whole path must be valid at.
    ///
    /// # Returns
    ///
    /// The leaf's identity and validity once every hop is a CA, valid at `at`,
    /// and verifies the signature of the certificate below it.
    pub fn validate_chain(
        &self,
        leaf_der: &[u8],
        chain_der: &[Vec<u8>],
        at: i64,
    ) -> Result<TrustedCertificate> {
        let anchors = parse_all(&self.anchors, "trust root")?;
        let intermediates = parse_all(
            self.intermediates.iter().chain(chain_der.iter()),
            "intermediate",
        )?;

        let (_, leaf) = X509Certificate::from_der(leaf_der)
            .map_err(|e| Error::CertificateTrust(format!("Failed to parse certificate: {e}")))?;

        check_validity(&leaf, at)?;

        let mut current = &leaf;
        for _ in 0..MAX_PATH_LENGTH {
            if let Some(anchor) = anchors.iter().find(|c| issues(c, current)) {
                check_validity(anchor, at)?;
                return Ok(TrustedCertificate {
                    identity: san_identity(&leaf),
                    issuer: leaf.issuer().to_string(),
                    not_before: leaf.validity().not_before.timestamp(),
                    not_after: leaf.validity().not_after.timestamp(),
                });
            }

            let next = intermediates
                .iter()
                .find(|c| issues(c, current))
                .ok_or_else(|| {
                    Error::CertificateTrust(format!(
                        "No trusted issuer found for '{}'",
                        current.issuer()
                    ))
                })?;

            check_validity(next, at)?;
            log::trace!(
                "'{}' issued by intermediate '{}'",
                current.subject(),
                next.subject()
            );
            current = next;
        }

        Err(Error::CertificateTrust(format!(
            "No path to a trust anchor within {MAX_PATH_LENGTH} certificates"
        )))
    }
}

fn parse_all<'a>(
    ders: impl IntoIterator<Item = &'a Vec<u8>>,
    what: &str,
) -> Result<Vec<X509Certificate<'a>>> {
    ders.into_iter()
        .map(|der| {
            X509Certificate::from_der(der)
                .map(|(_, cert)| cert)
                .map_err(|e| Error::CertificateTrust(format!("Invalid {what} certificate: {e}")))
        })
        .collect()
}

/// Whether `issuer` is a CA named as the issuer of `cert` whose key verifies it.
fn issues(issuer: &X509Certificate<'_>, cert: &X509Certificate<'_>) -> bool {
    issuer.subject().as_raw() == cert.issuer().as_raw()
        && issuer.is_ca()
        && cert.verify_signature(Some(issuer.public_key())).is_ok()
}

fn check_validity(cert: &X509Certificate<'_>, at: i64) -> Result<()> {
    let validity = cert.validity();
    let not_before = validity.not_before.timestamp();
    let not_after = validity.not_after.timestamp();

    if at < not_before || at > not_after {
        return Err(Error::CertificateTrust(format!(
            "'{}' is not valid at {} (valid {} to {})",
            cert.subject(),
            format_unix(at),
            format_unix(not_before),
            format_unix(not_after)
        )));
    }

    Ok(())
}

fn san_identity(cert: &X509Certificate<'_>) -> Option<String> {
    let san = cert.subject_alternative_name().ok().flatten()?;
    san.value.general_names.iter().find_map(|name| match name {
        GeneralName::RFC822Name(email) => Some((*email).to_owned()),
        GeneralName::URI(uri) => Some((*uri).to_owned()),
        _ => None,
    })
}

pub(crate) fn format_unix(secs: i64) -> String {
    chrono::DateTime::from_timestamp(secs, 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| secs.to_string())
}

/// Extracts the ECDSA P-256 public key from a DER certificate.
pub fn certificate_public_key(cert_der: &[u8]) -> anyhow::Result<VerifyingKey> {
    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|e| anyhow!("Failed to parse certificate: {e}"))?;

    VerifyingKey::from_public_key_der(cert.public_key().raw)
        .map_err(|e| anyhow!("Certificate key is not an ECDSA P-256 key: {e}"))
}
