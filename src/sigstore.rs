use std::{
    fmt, fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::anyhow;
use log::info;
use serde::{Deserialize, Serialize};

use crate::{
    dsse::{self, Envelope, EnvelopePolicy, PayloadType},
    error::{Error, Result},
    fulcio::{FulcioClient, DEFAULT_FULCIO_URL},
    identity::{IdentityToken, OidcProvider},
    rekor::{RekorClient, DEFAULT_REKOR_URL},
    signer::{LogPolicy, SignedPayload, Signer},
    sigstore_bundle::SigstoreBundle,
    trust::TrustRoot,
    verifier::{TrustSource, Verifier},
};

/// Default OIDC issuer.
pub const DEFAULT_OIDC_ISSUER: &str = "https://oauth2.sigstore.dev/auth";

/// Default OIDC client id.
pub const DEFAULT_OIDC_CLIENT_ID: &str = "sigstore";

/// Endpoints and policies for a [`Sigstore`] instance.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SigstoreOptions {
    /// Certificate authority base URL
    pub fulcio_base_url: String,
    /// Transparency log base URL
    pub rekor_base_url: String,
    /// OIDC issuer URL
    pub oidc_issuer: String,
    /// OIDC client id
    pub oidc_client_id: String,
    /// OIDC client secret, enables the client-credentials grant
    pub oidc_client_secret: Option<String>,
    /// PEM bundle of trusted roots and their intermediates; the CA trust bundle
    /// is used when unset
    pub trust_root_file: Option<PathBuf>,
    /// Whether log submission failure fails signing
    pub log_policy: LogPolicy,
    /// How multi-signature envelopes are verified
    pub envelope_policy: EnvelopePolicy,
}

impl Default for SigstoreOptions {
    fn default() -> Self {
        Self {
            fulcio_base_url: DEFAULT_FULCIO_URL.to_owned(),
            rekor_base_url: DEFAULT_REKOR_URL.to_owned(),
            oidc_issuer: DEFAULT_OIDC_ISSUER.to_owned(),
            oidc_client_id: DEFAULT_OIDC_CLIENT_ID.to_owned(),
            oidc_client_secret: None,
            trust_root_file: None,
            log_policy: LogPolicy::default(),
            envelope_policy: EnvelopePolicy::default(),
        }
    }
}

impl fmt::Debug for SigstoreOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigstoreOptions")
            .field("fulcio_base_url", &self.fulcio_base_url)
            .field("rekor_base_url", &self.rekor_base_url)
            .field("oidc_issuer", &self.oidc_issuer)
            .field("oidc_client_id", &self.oidc_client_id)
            .field(
                "oidc_client_secret",
                &self.oidc_client_secret.as_ref().map(|_| "<redacted>"),
            )
            .field("trust_root_file", &self.trust_root_file)
            .field("log_policy", &self.log_policy)
            .field("envelope_policy", &self.envelope_policy)
            .finish()
    }
}

impl SigstoreOptions {
    /// Loads options from a JSON file.
    ///
    /// Returns `None` if the file doesn't exist. Missing fields take their defaults.
    pub fn load(options_file: &Path) -> Result<Option<Self>> {
        if options_file.exists() {
            let contents = fs::read_to_string(options_file).map_err(|e| {
                Error::Config(anyhow!("Failed to read {}: {e}", options_file.display()))
            })?;
            let options = serde_json::from_str::<SigstoreOptions>(&contents).map_err(|e| {
                Error::Config(anyhow!("Invalid options in {}: {e}", options_file.display()))
            })?;

            Ok(Some(options))
        } else {
            info!("No sigstore options found at {}", options_file.display());

            Ok(None)
        }
    }

    fn trust_source(&self, fulcio: &Arc<FulcioClient>) -> Result<TrustSource> {
        match &self.trust_root_file {
            Some(path) => {
                let pem = fs::read_to_string(path).map_err(|e| {
                    Error::Config(anyhow!("Failed to read {}: {e}", path.display()))
                })?;
                let root = TrustRoot::from_pems([pem.as_str()]).map_err(Error::Config)?;
                info!("Pinned {} trusted certificates from {}", root.len(), path.display());

                Ok(TrustSource::Pinned(root))
            }
            None => Ok(TrustSource::Authority(fulcio.clone())),
        }
    }
}

/// Keyless signing and verification.
///
/// Each instance owns its configuration; instances with different endpoints
/// can coexist in one process.
pub struct Sigstore {
    signer: Signer,
    verifier: Verifier,
    envelope_policy: EnvelopePolicy,
}

impl Sigstore {
    /// Builds HTTP clients for the configured endpoints.
    ///
    /// # Arguments
    ///
    /// * `options` - Endpoints, credentials and policies.
    ///
    /// # Returns
    ///
    /// A ready instance. Fails with [`Error::Config`] when `trust_root_file`
    /// is set but cannot be read as a certificate bundle.
    pub fn new(options: SigstoreOptions) -> Result<Self> {
        let fulcio = Arc::new(FulcioClient::new(&options.fulcio_base_url));
        let rekor = Arc::new(RekorClient::new(&options.rekor_base_url));
        let identity = Arc::new(OidcProvider::new(
            options.oidc_issuer.clone(),
            options.oidc_client_id.clone(),
            options.oidc_client_secret.clone(),
        ));

        let trust = options.trust_source(&fulcio)?;

        let signer = Signer::new(identity, fulcio, rekor.clone()).with_log_policy(options.log_policy);
        let verifier = Verifier::new(rekor, trust);

        log::debug!("Created sigstore client with {options:?}");

        Ok(Self::from_parts(signer, verifier).with_envelope_policy(options.envelope_policy))
    }

    /// Assembles an instance from existing collaborators.
    pub fn from_parts(signer: Signer, verifier: Verifier) -> Self {
        Self {
            signer,
            verifier,
            envelope_policy: EnvelopePolicy::default(),
        }
    }

    /// Sets how multi-signature envelopes are verified.
    pub fn with_envelope_policy(mut self, envelope_policy: EnvelopePolicy) -> Self {
        self.envelope_policy = envelope_policy;
        self
    }

    /// Signs raw bytes.
    ///
    /// # Arguments
    ///
    /// * `payload` - Bytes to sign.
    /// * `identity_token` - Optional token; the configured OIDC provider is used otherwise.
    ///
    /// # Returns
    ///
    /// The signature with its certificate and log entry.
    pub async fn sign_raw(
        &self,
        payload: &[u8],
        identity_token: Option<IdentityToken>,
    ) -> Result<SignedPayload> {
        self.signer.sign(payload, identity_token).await
    }

    /// Signs `payload` into a DSSE envelope.
    ///
    /// # Arguments
    ///
    /// * `payload` - Bytes to wrap.
    /// * `payload_type` - The envelope's payload type.
    /// * `identity_token` - Optional token; the configured OIDC provider is used otherwise.
    ///
    /// # Returns
    ///
    /// A single-signature envelope over the PAE of `payload_type` and `payload`.
    pub async fn sign_dsse(
        &self,
        payload: &[u8],
        payload_type: &PayloadType,
        identity_token: Option<IdentityToken>,
    ) -> Result<Envelope> {
        dsse::build_envelope(payload_type, payload, &self.signer, identity_token).await
    }

    /// Signs `payload` into a DSSE envelope packaged as a Sigstore bundle.
    ///
    /// Takes the same arguments as [`Sigstore::sign_dsse`].
    ///
    /// # Returns
    ///
    /// A bundle carrying the envelope, the signing certificate and the log entry.
    pub async fn sign_dsse_bundle(
        &self,
        payload: &[u8],
        payload_type: &PayloadType,
        identity_token: Option<IdentityToken>,
    ) -> Result<SigstoreBundle> {
        let (envelope, signed) =
            dsse::sign_envelope(payload_type, payload, &self.signer, identity_token).await?;
        SigstoreBundle::from_envelope(&envelope, &signed)
    }

    /// Verifies a base64 signature over raw bytes.
    ///
    /// # Arguments
    ///
    /// * `payload` - The bytes that were signed.
    /// * `signature` - Base64 signature from [`SignedPayload::base64_signature`].
    ///
    /// # Returns
    ///
    /// `Ok(false)` for any signature that is not valid. See [`Verifier::verify`]
    /// for the cases that are errors instead.
    pub async fn verify_raw(&self, payload: &[u8], signature: &str) -> Result<bool> {
        self.verifier.verify(payload, signature).await
    }

    /// Verifies a DSSE envelope.
    ///
    /// # Arguments
    ///
    /// * `envelope` - The envelope as received.
    ///
    /// # Returns
    ///
    /// Whether the envelope's signatures verify under the configured
    /// [`EnvelopePolicy`]. A structurally invalid envelope is an error.
    pub async fn verify_dsse(&self, envelope: &Envelope) -> Result<bool> {
        dsse::verify_envelope(envelope, &self.verifier, self.envelope_policy).await
    }
}
