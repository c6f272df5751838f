use std::collections::HashMap;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use base64::engine::{general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};

use crate::{fulcio::EphemeralCertificate, merkle};

/// Default public transparency log.
pub const DEFAULT_REKOR_URL: &str = "https://rekor.sigstore.dev";

/// Record stored in the log for one keyless signature.
///
/// Serialized as a `hashedrekord` v0.0.1 entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashedRekord {
    /// SHA-256 of the signed bytes
    pub digest: [u8; 32],
    /// Signature over the signed bytes
    pub signature: Vec<u8>,
    /// PEM-encoded signing certificate
    pub certificate_pem: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProposedEntry {
    api_version: String,
    kind: String,
    spec: RekordSpec,
}

#[derive(Debug, Serialize, Deserialize)]
struct RekordSpec {
    data: RekordData,
    signature: RekordSignature,
}

#[derive(Debug, Serialize, Deserialize)]
struct RekordData {
    hash: RekordHash,
}

#[derive(Debug, Serialize, Deserialize)]
struct RekordHash {
    algorithm: String,
    value: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RekordSignature {
    content: String,
    public_key: RekordPublicKey,
}

#[derive(Debug, Serialize, Deserialize)]
struct RekordPublicKey {
    content: String,
}

impl HashedRekord {
    fn to_proposed_entry(&self) -> ProposedEntry {
        ProposedEntry {
            api_version: "0.0.1".to_owned(),
            kind: "hashedrekord".to_owned(),
            spec: RekordSpec {
                data: RekordData {
                    hash: RekordHash {
                        algorithm: "sha256".to_owned(),
                        value: hex::encode(self.digest),
                    },
                },
                signature: RekordSignature {
                    content: BASE64.encode(&self.signature),
                    public_key: RekordPublicKey {
                        content: BASE64.encode(self.certificate_pem.as_bytes()),
                    },
                },
            },
        }
    }

    /// JSON body as the log stores it.
    pub fn to_body(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.to_proposed_entry())?)
    }

    /// Parses a decoded entry body.
    pub fn from_body(body: &[u8]) -> Result<Self> {
        let entry: ProposedEntry = serde_json::from_slice(body)
            .map_err(|e| anyhow!("Failed to parse log entry body: {e}"))?;

        if entry.kind != "hashedrekord" {
            bail!("Unsupported log entry kind '{}'", entry.kind);
        }

        let hash = entry.spec.data.hash;
        if hash.algorithm != "sha256" {
            bail!("Unsupported digest algorithm '{}'", hash.algorithm);
        }

        let digest = hex::decode(&hash.value)?
            .try_into()
            .map_err(|_| anyhow!("Digest is not 32 bytes"))?;

        let signature = BASE64.decode(&entry.spec.signature.content)?;
        let certificate_pem =
            String::from_utf8(BASE64.decode(&entry.spec.signature.public_key.content)?)?;

        Ok(Self {
            digest,
            signature,
            certificate_pem,
        })
    }
}

/// Merkle inclusion proof for a log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InclusionProof {
    /// Index of the entry within the tree
    pub log_index: u64,
    /// Number of leaves in the tree the proof is for
    pub tree_size: u64,
    /// Hex-encoded tree root
    pub root_hash: String,
    /// Hex-encoded audit path, leaf upwards
    pub hashes: Vec<String>,
}

impl InclusionProof {
    /// Verifies that `body` is included in the tree this proof describes.
    pub fn verify(&self, body: &[u8]) -> Result<()> {
        let root = decode_hash(&self.root_hash)?;
        let hashes = self
            .hashes
            .iter()
            .map(|h| decode_hash(h))
            .collect::<Result<Vec<_>>>()?;

        merkle::verify_inclusion(
            self.log_index,
            self.tree_size,
            &merkle::leaf_hash(body),
            &hashes,
            &root,
        )
    }
}

fn decode_hash(hash: &str) -> Result<[u8; 32]> {
    hex::decode(hash)?
        .try_into()
        .map_err(|_| anyhow!("Tree hash is not 32 bytes"))
}

/// Reference to a transparency log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// Entry UUID
    pub uuid: String,
    /// Global index in the log
    pub log_index: u64,
    /// Identifier of the log instance
    pub log_id: String,
    /// Time the log integrated the entry (unix seconds)
    pub integrated_time: i64,
    /// Base64-encoded entry body
    pub body: String,
    /// Inclusion proof, when the log returned one
    pub inclusion_proof: Option<InclusionProof>,
    /// Base64-encoded signed entry timestamp, when the log returned one
    pub signed_entry_timestamp: Option<String>,
}

impl LogEntry {
    /// Decoded entry body.
    pub fn body_bytes(&self) -> Result<Vec<u8>> {
        BASE64
            .decode(&self.body)
            .map_err(|e| anyhow!("Log entry body is not base64: {e}"))
    }

    /// The record the body holds.
    pub fn record(&self) -> Result<HashedRekord> {
        HashedRekord::from_body(&self.body_bytes()?)
    }

    /// Checks the entry's inclusion proof against its body.
    pub fn verify_inclusion(&self) -> Result<()> {
        let proof = self
            .inclusion_proof
            .as_ref()
            .ok_or_else(|| anyhow!("Log entry {} has no inclusion proof", self.uuid))?;

        proof.verify(&self.body_bytes()?)
    }
}

/// Append-only transparency log.
#[async_trait]
pub trait TransparencyLog: Send + Sync {
    /// Records a signature and its certificate for the given payload digest.
    async fn submit_entry(
        &self,
        digest: &[u8; 32],
        signature: &[u8],
        certificate: &EphemeralCertificate,
    ) -> Result<LogEntry>;

    /// Finds the entry recording `signature` over the payload with `digest`.
    async fn lookup_entry(&self, digest: &[u8; 32], signature: &[u8]) -> Result<Option<LogEntry>>;
}

#[derive(Debug, Deserialize)]
struct EntryResponse {
    body: String,
    #[serde(rename = "integratedTime")]
    integrated_time: i64,
    #[serde(rename = "logID")]
    log_id: String,
    #[serde(rename = "logIndex")]
    log_index: u64,
    verification: Option<Verification>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Verification {
    inclusion_proof: Option<InclusionProof>,
    signed_entry_timestamp: Option<String>,
}

#[derive(Debug, Serialize)]
struct SearchIndex {
    hash: String,
}

/// HTTP client for a Rekor-compatible transparency log.
#[derive(Clone, Debug)]
pub struct RekorClient {
    base_url: String,
    client: reqwest::Client,
}

impl RekorClient {
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

    /// Fetches one entry by UUID.
    pub async fn get_entry(&self, uuid: &str) -> Result<LogEntry> {
        let url = format!("{}/api/v1/log/entries/{uuid}", self.base_url);
        log::trace!("Fetching log entry {url}");

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            bail!("Request failed with status {status}: {text}");
        }

        parse_entries(&text)?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("Log returned no entry for {uuid}"))
    }

    async fn search_by_digest(&self, digest: &[u8; 32]) -> Result<Vec<String>> {
        let url = format!("{}/api/v1/index/retrieve", self.base_url);
        let request = SearchIndex {
            hash: format!("sha256:{}", hex::encode(digest)),
        };

        let response = self.client.post(&url).json(&request).send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            bail!("Index search failed with status {status}: {text}");
        }

        serde_json::from_str(&text).map_err(|e| anyhow!("Failed to parse index response: {e}"))
    }
}

impl Default for RekorClient {
    fn default() -> Self {
        Self::new(DEFAULT_REKOR_URL)
    }
}

fn parse_entries(text: &str) -> Result<Vec<LogEntry>> {
    let entries: HashMap<String, EntryResponse> =
        serde_json::from_str(text).map_err(|e| anyhow!("Failed to parse log entry: {e}"))?;

    Ok(entries
        .into_iter()
        .map(|(uuid, entry)| {
            let (inclusion_proof, signed_entry_timestamp) = match entry.verification {
                Some(v) => (v.inclusion_proof, v.signed_entry_timestamp),
                None => (None, None),
            };

            LogEntry {
                uuid,
                log_index: entry.log_index,
                log_id: entry.log_id,
                integrated_time: entry.integrated_time,
                body: entry.body,
                inclusion_proof,
                signed_entry_timestamp,
            }
        })
        .collect())
}

#[async_trait]
impl TransparencyLog for RekorClient {
    async fn submit_entry(
        &self,
        digest: &[u8; 32],
        signature: &[u8],
        certificate: &EphemeralCertificate,
    ) -> Result<LogEntry> {
        let url = format!("{}/api/v1/log/entries", self.base_url);

        let record = HashedRekord {
            digest: *digest,
            signature: signature.to_vec(),
            certificate_pem: certificate.leaf_pem.clone(),
        };

        log::debug!("Submitting log entry to {url}");

        let response = self
            .client
            .post(&url)
            .json(&record.to_proposed_entry())
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        if status != reqwest::StatusCode::CREATED {
            bail!("Upload failed with status {status}: {text}");
        }

        parse_entries(&text)?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No entry returned in response"))
    }

    async fn lookup_entry(&self, digest: &[u8; 32], signature: &[u8]) -> Result<Option<LogEntry>> {
        let uuids = self.search_by_digest(digest).await?;
        log::debug!("Log index holds {} entries for digest", uuids.len());

        for uuid in uuids {
            let entry = self.get_entry(&uuid).await?;

            match entry.record() {
                Ok(record) if record.digest == *digest && record.signature == signature => {
                    return Ok(Some(entry));
                }
                Ok(_) => continue,
                Err(e) => log::debug!("Skipping log entry {uuid}: {e:#}"),
            }
        }

        Ok(None)
    }
}
