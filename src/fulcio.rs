use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use base64::engine::{general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};

use crate::{identity::IdentityToken, trust::TrustRoot};

/// Default public certificate authority.
pub const DEFAULT_FULCIO_URL: &str = "https://fulcio.sigstore.dev";

/// Short-lived certificate binding an ephemeral public key to an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EphemeralCertificate {
    /// PEM-encoded leaf certificate
    pub leaf_pem: String,
    /// PEM-encoded issuing chain, leaf first
    pub chain: Vec<String>,
}

impl EphemeralCertificate {
    /// Builds a certificate from a PEM chain whose first entry is the leaf.
    pub fn from_chain(chain: Vec<String>) -> Result<Self> {
        let leaf_pem = chain
            .first()
            .cloned()
            .ok_or_else(|| anyhow!("Empty certificate chain"))?;

        Ok(Self { leaf_pem, chain })
    }

    /// DER bytes of the leaf certificate.
    pub fn leaf_der(&self) -> Result<Vec<u8>> {
        let pem = pem::parse(&self.leaf_pem)
            .map_err(|e| anyhow!("Failed to parse leaf certificate PEM: {e}"))?;
        Ok(pem.into_contents())
    }

    /// DER bytes of every certificate in the chain after the leaf.
    pub fn chain_der(&self) -> Result<Vec<Vec<u8>>> {
        self.chain
            .iter()
            .skip(1)
            .map(|text| {
                pem::parse(text)
                    .map(pem::Pem::into_contents)
                    .map_err(|e| anyhow!("Failed to parse chain certificate PEM: {e}"))
            })
            .collect()
    }
}

/// Certificate authority issuing ephemeral signing certificates.
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Requests a certificate for `public_key_pem` (SPKI PEM).
    ///
    /// `proof_of_possession` is a signature by the matching private key over the
    /// token subject.
    async fn request_certificate(
        &self,
        identity_token: &IdentityToken,
        public_key_pem: &str,
        proof_of_possession: &[u8],
    ) -> Result<EphemeralCertificate>;

    /// Returns the certificates this authority issues from.
    async fn trust_bundle(&self) -> Result<TrustRoot>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SigningCertRequest<'a> {
    credentials: Credentials<'a>,
    public_key_request: PublicKeyRequest,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Credentials<'a> {
    oidc_identity_token: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PublicKeyRequest {
    public_key: PublicKey,
    proof_of_possession: String,
}

#[derive(Debug, Serialize)]
struct PublicKey {
    algorithm: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SigningCertResponse {
    signed_certificate_embedded_sct: Option<SignedCertificate>,
    signed_certificate_detached_sct: Option<SignedCertificate>,
}

#[derive(Debug, Deserialize)]
struct SignedCertificate {
    chain: Chain,
}

#[derive(Debug, Deserialize)]
struct Chain {
    certificates: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TrustBundleResponse {
    chains: Vec<Chain>,
}

/// HTTP client for a Fulcio-compatible certificate authority.
#[derive(Clone, Debug)]
pub struct FulcioClient {
    base_url: String,
    client: reqwest::Client,
}

impl FulcioClient {
    /// Creates a client for the given base URL.
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            client: reqwest::Client::new(),
        }
    }

    /// The configured base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl Default for FulcioClient {
    fn default() -> Self {
        Self::new(DEFAULT_FULCIO_URL)
    }
}

#[async_trait]
impl CertificateAuthority for FulcioClient {
    async fn request_certificate(
        &self,
        identity_token: &IdentityToken,
        public_key_pem: &str,
        proof_of_possession: &[u8],
    ) -> Result<EphemeralCertificate> {
        let url = format!("{}/api/v2/signingCert", self.base_url);

        let request = SigningCertRequest {
            credentials: Credentials {
                oidc_identity_token: identity_token.as_str(),
            },
            public_key_request: PublicKeyRequest {
                public_key: PublicKey {
                    algorithm: "ECDSA",
                    content: public_key_pem.to_owned(),
                },
                proof_of_possession: BASE64.encode(proof_of_possession),
            },
        };

        log::debug!("Requesting signing certificate from {url}");

        let response = self.client.post(&url).json(&request).send().await?;

        let status = response.status();
        let text = response.text().await?;

        log::trace!("Response status: {status}");

        if !status.is_success() {
            bail!("Request failed with status {status}: {text}");
        }

        let response: SigningCertResponse = serde_json::from_str(&text)
            .map_err(|e| anyhow!("Failed to parse signing certificate response: {e}"))?;

        let signed = response
            .signed_certificate_embedded_sct
            .or(response.signed_certificate_detached_sct)
            .ok_or_else(|| anyhow!("Response contains no signed certificate"))?;

        EphemeralCertificate::from_chain(signed.chain.certificates)
    }

    async fn trust_bundle(&self) -> Result<TrustRoot> {
        let url = format!("{}/api/v2/trustBundle", self.base_url);

        log::debug!("Fetching trust bundle from {url}");

        let response = self.client.get(&url).send().await?;

        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            bail!("Request failed with status {status}: {text}");
        }

        let bundle: TrustBundleResponse = serde_json::from_str(&text)
            .map_err(|e| anyhow!("Failed to parse trust bundle: {e}"))?;

        let pems = bundle
            .chains
            .into_iter()
            .flat_map(|chain| chain.certificates)
            .collect::<Vec<_>>();

        TrustRoot::from_pems(pems.iter().map(String::as_str))
    }
}
