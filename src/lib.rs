//! Keyless signing and verification.
//!
//! A signature is produced with a key that exists for a single call. The key is
//! bound to an OIDC identity by a short-lived certificate from a Fulcio-style
//! certificate authority, and the signature is recorded in a Rekor-style
//! transparency log. Verification trusts a signature only when the log holds
//! it, its certificate chains to the trust root at the time it was logged, and
//! it matches the payload.
//!
//! Payloads are signed raw or wrapped in a DSSE envelope.

/// DSSE envelopes and pre-authentication encoding
pub mod dsse;

/// Error type
pub mod error;

/// Certificate authority client
pub mod fulcio;

/// OIDC identity tokens and providers
pub mod identity;

/// RFC 6962 Merkle inclusion proofs
pub mod merkle;

/// Transparency log client
pub mod rekor;

/// Keyless signer
pub mod signer;

/// Facade tying signing and verification to configuration
pub mod sigstore;

/// Sigstore bundle format support
pub mod sigstore_bundle;

/// Trust roots and certificate path validation
pub mod trust;

/// Keyless verifier
pub mod verifier;

#[cfg(test)]
pub(crate) mod test_support;

pub use dsse::{pae, Envelope, EnvelopePolicy, PayloadType};
pub use error::{Error, Result};
pub use identity::IdentityToken;
pub use signer::{LogPolicy, SignedPayload, Signer};
pub use sigstore::{Sigstore, SigstoreOptions};
pub use verifier::{TrustSource, Verifier};
