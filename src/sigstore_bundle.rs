use base64::engine::{general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{
    dsse::Envelope,
    error::{Error, Result},
    rekor::LogEntry,
    signer::SignedPayload,
};

const BUNDLE_MEDIA_TYPE: &str = "application/vnd.dev.sigstore.bundle.v0.3+json";

/// A Sigstore bundle containing signature verification material and a DSSE envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SigstoreBundle {
    media_type: String,
    verification_material: Value,
    dsse_envelope: Value,
}

impl SigstoreBundle {
    /// Creates a new Sigstore bundle with the given verification material and DSSE envelope.
    ///
    /// # Arguments
    ///
    /// * `verification_material` - JSON value containing public key or certificate information.
    /// * `dsse_envelope` - The DSSE envelope containing the signed payload.
    ///
    /// # Returns
    ///
    /// A new `SigstoreBundle` with the standard media type.
    pub fn new(verification_material: Value, dsse_envelope: Value) -> SigstoreBundle {
        SigstoreBundle {
            media_type: BUNDLE_MEDIA_TYPE.to_owned(),
            verification_material,
            dsse_envelope,
        }
    }

    /// Bundles a keylessly signed envelope with its certificate and log entry.
    pub fn from_envelope(envelope: &Envelope, signed: &SignedPayload) -> Result<SigstoreBundle> {
        let certificate = signed.certificate.leaf_der().map_err(|e| {
            Error::Crypto(format!("Failed to decode signing certificate: {e:#}"))
        })?;

        let tlog_entries = signed
            .log_entry
            .iter()
            .map(tlog_entry)
            .collect::<Vec<_>>();

        let verification_material = json!({
            "certificate": { "rawBytes": BASE64.encode(certificate) },
            "tlogEntries": tlog_entries,
        });

        let dsse_envelope = serde_json::to_value(envelope)
            .map_err(|e| Error::MalformedEnvelope(format!("Failed to serialize envelope: {e}")))?;

        Ok(SigstoreBundle::new(verification_material, dsse_envelope))
    }

    /// The bundle media type.
    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    /// Verification material (certificate and log entries).
    pub fn verification_material(&self) -> &Value {
        &self.verification_material
    }

    /// The bundled envelope.
    pub fn dsse_envelope(&self) -> Result<Envelope> {
        serde_json::from_value(self.dsse_envelope.clone())
            .map_err(|e| Error::MalformedEnvelope(format!("Bundle envelope is invalid: {e}")))
    }
}

fn tlog_entry(entry: &LogEntry) -> Value {
    // Bundle hashes are base64; the log serves hex.
    let rehash = |hex_hash: &str| {
        hex::decode(hex_hash)
            .map(|bytes| BASE64.encode(bytes))
            .unwrap_or_else(|_| hex_hash.to_owned())
    };

    let mut value = json!({
        "logIndex": entry.log_index.to_string(),
        "logId": { "keyId": rehash(entry.log_id.as_str()) },
        "kindVersion": { "kind": "hashedrekord", "version": "0.0.1" },
        "integratedTime": entry.integrated_time.to_string(),
        "canonicalizedBody": entry.body,
    });

    if let Some(set) = &entry.signed_entry_timestamp {
        value["inclusionPromise"] = json!({ "signedEntryTimestamp": set });
    }

    if let Some(proof) = &entry.inclusion_proof {
        value["inclusionProof"] = json!({
            "logIndex": proof.log_index.to_string(),
            "rootHash": rehash(proof.root_hash.as_str()),
            "treeSize": proof.tree_size.to_string(),
            "hashes": proof.hashes.iter().map(|h| rehash(h.as_str())).collect::<Vec<_>>(),
        });
    }

    value
}
