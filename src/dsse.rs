use std::{fmt, str::FromStr};

use base64::engine::{general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    identity::IdentityToken,
    signer::{SignedPayload, Signer},
    verifier::Verifier,
};

const PAE_PREFIX: &str = "DSSEv1";

/// Pre-authentication encoding of a typed payload.
///
/// `"DSSEv1" SP len(type) SP type SP len(payload) SP payload`, with lengths as
/// ASCII decimal byte counts. This is the exact byte string that gets signed.
pub fn pae(payload_type: &str, payload: &[u8]) -> Vec<u8> {
    let type_len = payload_type.len().to_string();
    let payload_len = payload.len().to_string();

    let mut out = Vec::with_capacity(payload_type.len() + payload.len() + 32);
    out.extend_from_slice(PAE_PREFIX.as_bytes());
    out.push(b' ');
    out.extend_from_slice(type_len.as_bytes());
    out.push(b' ');
    out.extend_from_slice(payload_type.as_bytes());
    out.push(b' ');
    out.extend_from_slice(payload_len.as_bytes());
    out.push(b' ');
    out.extend_from_slice(payload);
    out
}

/// Dead Simple Signing Envelope (DSSE).
///
/// Kept in wire form: `payload` and every `sig` are standard base64 text, so
/// an envelope read from JSON is verified exactly as received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Media type of the payload
    pub payload_type: String,
    /// Base64-encoded payload
    pub payload: String,
    /// One or more signatures over the PAE of the payload
    pub signatures: Vec<Signature>,
}

/// One signature within a DSSE envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// Key identifier; empty for keyless signatures
    #[serde(default)]
    pub keyid: String,
    /// Base64-encoded signature
    pub sig: String,
}

impl Envelope {
    /// Serializes the envelope to its JSON wire form.
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::MalformedEnvelope(format!("Failed to serialize envelope: {e}")))
    }

    /// Parses an envelope from its JSON wire form.
    pub fn try_from_json_string(s: &str) -> Result<Self> {
        serde_json::from_str(s)
            .map_err(|e| Error::MalformedEnvelope(format!("Failed to parse envelope: {e}")))
    }

    /// The decoded payload bytes.
    pub fn decoded_payload(&self) -> Result<Vec<u8>> {
        BASE64
            .decode(&self.payload)
            .map_err(|e| Error::MalformedEnvelope(format!("Payload is not base64: {e}")))
    }
}

/// Well-known payload types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadType {
    /// in-toto attestation in JSON format
    InTotoJson,
    /// Any other payload type
    Other(String),
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadType::InTotoJson => write!(f, "application/vnd.in-toto+json"),
            PayloadType::Other(s) => write!(f, "{}", s),
        }
    }
}

impl FromStr for PayloadType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "application/vnd.in-toto+json" => Ok(PayloadType::InTotoJson),
            _ => Ok(PayloadType::Other(s.to_owned())),
        }
    }
}

/// How an envelope with several signatures is judged.
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
pub enum EnvelopePolicy {
    /// Only the first signature is checked
    #[default]
    SingleSignature,
    /// Every signature must verify
    AllSignatures,
}

/// Signs `payload` keylessly and wraps it in a single-signature envelope.
///
/// # Arguments
///
/// * `payload_type` - The payload type, bound into the signature by the PAE.
/// * `payload` - The payload bytes.
/// * `signer` - The keyless signer to sign the PAE with.
/// * `identity_token` - Optional token overriding the signer's identity provider.
///
/// # Returns
///
/// An envelope with the base64 payload and one signature with an empty `keyid`.
pub async fn build_envelope(
    payload_type: &PayloadType,
    payload: &[u8],
    signer: &Signer,
    identity_token: Option<IdentityToken>,
) -> Result<Envelope> {
    let (envelope, _) = sign_envelope(payload_type, payload, signer, identity_token).await?;
    Ok(envelope)
}

/// Like [`build_envelope`], also returning the signing material.
pub async fn sign_envelope(
    payload_type: &PayloadType,
    payload: &[u8],
    signer: &Signer,
    identity_token: Option<IdentityToken>,
) -> Result<(Envelope, SignedPayload)> {
    let payload_type = payload_type.to_string();
    if payload_type.is_empty() {
        return Err(Error::MalformedEnvelope("Payload type is empty".to_owned()));
    }

    let signed = signer
        .sign(&pae(&payload_type, payload), identity_token)
        .await?;

    let envelope = Envelope {
        payload_type,
        payload: BASE64.encode(payload),
        signatures: vec![Signature {
            keyid: String::new(),
            sig: signed.base64_signature(),
        }],
    };

    Ok((envelope, signed))
}

/// Verifies an envelope's signatures over the PAE of its payload.
///
/// # Arguments
///
/// * `envelope` - The envelope as received.
/// * `verifier` - The keyless verifier to check each signature with.
/// * `policy` - Whether the first signature or all of them must verify.
///
/// # Returns
///
/// `Ok(true)` when the signatures selected by `policy` verify, `Ok(false)`
/// otherwise. Structural problems (empty payload type, payload not base64, no
/// signatures) are [`Error::MalformedEnvelope`].
pub async fn verify_envelope(
    envelope: &Envelope,
    verifier: &Verifier,
    policy: EnvelopePolicy,
) -> Result<bool> {
    if envelope.payload_type.is_empty() {
        return Err(Error::MalformedEnvelope("Payload type is empty".to_owned()));
    }
    if envelope.signatures.is_empty() {
        return Err(Error::MalformedEnvelope(
            "Envelope has no signatures".to_owned(),
        ));
    }

    let payload = envelope.decoded_payload()?;
    let message = pae(&envelope.payload_type, &payload);

    let signatures = match policy {
        EnvelopePolicy::SingleSignature => &envelope.signatures[..1],
        EnvelopePolicy::AllSignatures => &envelope.signatures[..],
    };

    for signature in signatures {
        if !verifier.verify(&message, &signature.sig).await? {
            log::debug!("Envelope signature '{}' did not verify", signature.keyid);
            return Ok(false);
        }
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        test_support::{test_token, MemoryLog, StaticIdentity, TestAuthority},
        verifier::TrustSource,
    };

    fn parties() -> (Signer, Verifier) {
        let authority = TestAuthority::new();
        let log = Arc::new(MemoryLog::new());
        let signer = Signer::new(
            Arc::new(StaticIdentity::new(Some(test_token("dev@example.com")))),
            Arc::new(authority.clone()),
            log.clone(),
        );
        let verifier = Verifier::new(log, TrustSource::Pinned(authority.trust_root()));
        (signer, verifier)
    }

    #[test]
    fn pae_known_vector() {
        assert_eq!(
            pae("http://example.com/HelloWorld", b"hello world"),
            b"DSSEv1 29 http://example.com/HelloWorld 11 hello world".to_vec()
        );
        assert_eq!(pae("", b""), b"DSSEv1 0  0 ".to_vec());
    }

    #[test]
    fn pae_separates_type_and_payload() {
        assert_ne!(pae("a", b"bc"), pae("ab", b"c"));
        assert_ne!(pae("a b", b"c"), pae("a", b"b c"));
        assert_ne!(pae("1", b"1 1"), pae("1 1", b"1"));
        assert_ne!(pae("ab", b""), pae("a", b"b"));
        assert_eq!(pae("t", b"p"), pae("t", b"p"));
    }

    #[test]
    fn envelope_wire_form() {
        let envelope = Envelope {
            payload_type: PayloadType::InTotoJson.to_string(),
            payload: BASE64.encode(b"{}"),
            signatures: vec![Signature {
                keyid: String::new(),
                sig: "AQID".to_owned(),
            }],
        };

        let json = envelope.to_json_string().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["payloadType"], "application/vnd.in-toto+json");
        assert_eq!(value["payload"], "e30=");
        assert_eq!(value["signatures"][0]["sig"], "AQID");

        let parsed = Envelope::try_from_json_string(&json).unwrap();
        assert_eq!(parsed, envelope);
        assert_eq!(parsed.decoded_payload().unwrap(), b"{}");
        assert!(matches!(
            Envelope::try_from_json_string("{"),
            Err(Error::MalformedEnvelope(_))
        ));
    }

    #[test]
    fn payload_type_strings() {
        assert_eq!(
            "application/vnd.in-toto+json".parse::<PayloadType>().unwrap(),
            PayloadType::InTotoJson
        );
        assert_eq!(
            "text/plain".parse::<PayloadType>().unwrap(),
            PayloadType::Other("text/plain".to_owned())
        );
        assert_eq!(EnvelopePolicy::AllSignatures.to_string(), "all-signatures");
    }

    #[tokio::test]
    async fn signed_envelope_verifies() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (signer, verifier) = parties();

        let envelope = build_envelope(&PayloadType::InTotoJson, b"{\"a\":1}", &signer, None)
            .await
            .unwrap();

        assert_eq!(envelope.payload, BASE64.encode(b"{\"a\":1}"));
        assert_eq!(envelope.signatures.len(), 1);
        assert!(verify_envelope(&envelope, &verifier, EnvelopePolicy::default())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn tampering_fails_verification() {
        let (signer, verifier) = parties();
        let envelope = build_envelope(&PayloadType::InTotoJson, b"{\"a\":1}", &signer, None)
            .await
            .unwrap();

        let mut changed_type = envelope.clone();
        changed_type.payload_type = "text/plain".to_owned();
        assert!(!verify_envelope(&changed_type, &verifier, EnvelopePolicy::default())
            .await
            .unwrap());

        let mut changed_payload = envelope.clone();
        changed_payload.payload = BASE64.encode(b"{\"a\":2}");
        assert!(!verify_envelope(&changed_payload, &verifier, EnvelopePolicy::default())
            .await
            .unwrap());

        let mut bad_sig = envelope.clone();
        bad_sig.signatures[0].sig = "not base64!".to_owned();
        assert!(!verify_envelope(&bad_sig, &verifier, EnvelopePolicy::default())
            .await
            .unwrap());

        // Valid base64, one byte off from what was signed and logged.
        let mut sig_bytes = BASE64.decode(&envelope.signatures[0].sig).unwrap();
        let last = sig_bytes.len() - 1;
        sig_bytes[last] ^= 0x01;
        let mut flipped_sig = envelope.clone();
        flipped_sig.signatures[0].sig = BASE64.encode(&sig_bytes);
        assert!(!verify_envelope(&flipped_sig, &verifier, EnvelopePolicy::default())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn malformed_envelopes_are_errors() {
        let (signer, verifier) = parties();
        let envelope = build_envelope(&PayloadType::InTotoJson, b"{}", &signer, None)
            .await
            .unwrap();

        let mut no_sigs = envelope.clone();
        no_sigs.signatures.clear();
        let mut bad_payload = envelope.clone();
        bad_payload.payload = "%%%".to_owned();
        let mut no_type = envelope.clone();
        no_type.payload_type.clear();

        for broken in [no_sigs, bad_payload, no_type] {
            let err = verify_envelope(&broken, &verifier, EnvelopePolicy::default())
                .await
                .unwrap_err();
            assert!(matches!(err, Error::MalformedEnvelope(_)), "{err}");
        }
    }

    #[tokio::test]
    async fn policy_decides_extra_signatures() {
        let (signer, verifier) = parties();
        let mut envelope = build_envelope(&PayloadType::InTotoJson, b"{}", &signer, None)
            .await
            .unwrap();
        envelope.signatures.push(Signature {
            keyid: "other".to_owned(),
            sig: BASE64.encode(b"unlogged"),
        });

        assert!(verify_envelope(&envelope, &verifier, EnvelopePolicy::SingleSignature)
            .await
            .unwrap());
        assert!(!verify_envelope(&envelope, &verifier, EnvelopePolicy::AllSignatures)
            .await
            .unwrap());
    }
}
