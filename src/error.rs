use thiserror::Error;

/// Errors raised by keyless signing and verification.
///
/// Each variant names the stage that failed. Collaborator errors are kept as the
/// source so the full chain is available to callers.
#[derive(Debug, Error)]
pub enum Error {
    /// No identity token could be obtained or the token is unusable.
    #[error("identity token unavailable: {0:#}")]
    Identity(#[source] anyhow::Error),

    /// The certificate authority rejected the request or could not be reached.
    #[error("certificate issuance failed: {0:#}")]
    CertificateIssuance(#[source] anyhow::Error),

    /// The transparency log rejected the entry or could not be reached.
    #[error("transparency log submission failed: {0:#}")]
    LogSubmission(#[source] anyhow::Error),

    /// No matching transparency log entry was found, or the log could not be queried.
    #[error("transparency log lookup failed: {0}")]
    LogLookup(String),

    /// The trust bundle could not be fetched from the certificate authority.
    #[error("trust root unavailable: {0:#}")]
    TrustRootUnavailable(#[source] anyhow::Error),

    /// The signing certificate does not chain to the trust root at signing time.
    #[error("certificate not trusted: {0}")]
    CertificateTrust(String),

    /// The signature does not match the payload.
    #[error("signature mismatch: {0}")]
    SignatureMismatch(String),

    /// The envelope is structurally invalid.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Local key or encoding failure.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Invalid or unreadable configuration.
    #[error("configuration error: {0:#}")]
    Config(#[source] anyhow::Error),
}

impl Error {
    /// Whether this error means "the signature is not trustworthy" rather than a
    /// usage or infrastructure failure.
    ///
    /// Boolean verification calls report these as `false`.
    pub fn is_verification_failure(&self) -> bool {
        matches!(
            self,
            Error::LogLookup(_) | Error::CertificateTrust(_) | Error::SignatureMismatch(_)
        )
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
