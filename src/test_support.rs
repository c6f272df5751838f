//! In-process stand-ins for the identity provider, certificate authority and
//! transparency log.

use std::{
    str::FromStr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use base64::engine::{
    general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD as BASE64_URL},
    Engine,
};
use p256::{
    ecdsa::{signature::Verifier as _, DerSignature, Signature, SigningKey, VerifyingKey},
    elliptic_curve::rand_core::OsRng,
    pkcs8::{DecodePublicKey, EncodePublicKey},
};
use x509_cert::{
    builder::{Builder, CertificateBuilder, Profile},
    der::{asn1::Ia5String, pem::LineEnding, Encode, EncodePem},
    ext::pkix::{name::GeneralName, SubjectAltName},
    name::Name,
    serial_number::SerialNumber,
    spki::SubjectPublicKeyInfoOwned,
    time::Validity,
    Certificate,
};

use crate::{
    fulcio::{CertificateAuthority, EphemeralCertificate},
    identity::{IdentityProvider, IdentityToken},
    merkle,
    rekor::{HashedRekord, InclusionProof, LogEntry, TransparencyLog},
    trust::TrustRoot,
};

const LEAF_LIFETIME: Duration = Duration::from_secs(600);
const ROOT_LIFETIME: Duration = Duration::from_secs(3600);

static SERIAL: AtomicU32 = AtomicU32::new(2);

/// Unsigned JWT carrying `email` as its identity.
pub(crate) fn test_token(email: &str) -> IdentityToken {
    let header = BASE64_URL.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
    let claims = serde_json::json!({
        "iss": "https://issuer.example",
        "sub": "0123456789",
        "email": email,
        "exp": chrono::Utc::now().timestamp() + 600,
    });
    let payload = BASE64_URL.encode(claims.to_string());
    IdentityToken::new(format!("{header}.{payload}.c2ln"))
}

/// Identity provider returning a fixed token, or failing when it has none.
pub(crate) struct StaticIdentity {
    token: Option<IdentityToken>,
}

impl StaticIdentity {
    pub(crate) fn new(token: Option<IdentityToken>) -> Self {
        Self { token }
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn obtain_token(&self) -> Result<IdentityToken> {
        self.token
            .clone()
            .ok_or_else(|| anyhow!("No identity token configured"))
    }
}

/// Self-signed root issuing short-lived leaf certificates, directly or
/// through one intermediate.
#[derive(Clone)]
pub(crate) struct TestAuthority {
    key: SigningKey,
    name: Name,
    root_der: Vec<u8>,
    intermediate_der: Option<Vec<u8>>,
    reject: bool,
    wrong_key: bool,
}

fn spki(key: &VerifyingKey) -> SubjectPublicKeyInfoOwned {
    let der = key.to_public_key_der().expect("encode public key");
    SubjectPublicKeyInfoOwned::try_from(der.as_bytes()).expect("parse public key info")
}

impl TestAuthority {
    pub(crate) fn new() -> Self {
        let key = SigningKey::random(&mut OsRng);
        let name = Name::from_str("CN=Keyless Test Root,O=Example").expect("root name");

        let builder = CertificateBuilder::new(
            Profile::Root,
            SerialNumber::from(1u32),
            Validity::from_now(ROOT_LIFETIME).expect("root validity"),
            name.clone(),
            spki(key.verifying_key()),
            &key,
        )
        .expect("root builder");
        let root: Certificate = builder.build::<DerSignature>().expect("build root");

        Self {
            key,
            name,
            root_der: root.to_der().expect("encode root"),
            intermediate_der: None,
            reject: false,
            wrong_key: false,
        }
    }

    /// Issues leaves from a fresh intermediate signed by the root.
    pub(crate) fn with_intermediate(mut self) -> Self {
        let key = SigningKey::random(&mut OsRng);
        let name = Name::from_str("CN=Keyless Test Intermediate,O=Example").expect("name");

        let builder = CertificateBuilder::new(
            Profile::SubCA {
                issuer: self.name.clone(),
                path_len_constraint: Some(0),
            },
            SerialNumber::from(SERIAL.fetch_add(1, Ordering::Relaxed)),
            Validity::from_now(ROOT_LIFETIME).expect("intermediate validity"),
            name.clone(),
            spki(key.verifying_key()),
            &self.key,
        )
        .expect("intermediate builder");
        let intermediate: Certificate = builder.build::<DerSignature>().expect("build intermediate");

        self.intermediate_der = Some(intermediate.to_der().expect("encode intermediate"));
        self.key = key;
        self.name = name;
        self
    }

    /// Refuses every certificate request.
    pub(crate) fn rejecting(mut self) -> Self {
        self.reject = true;
        self
    }

    /// Issues certificates for a key other than the one requested.
    pub(crate) fn issuing_for_other_key(mut self) -> Self {
        self.wrong_key = true;
        self
    }

    /// Root and intermediate, as a CA trust bundle serves them.
    pub(crate) fn trust_root(&self) -> TrustRoot {
        let mut certificates = vec![self.root_der.clone()];
        certificates.extend(self.intermediate_der.clone());
        TrustRoot::from_der(certificates).expect("trust root")
    }

    /// The root alone.
    pub(crate) fn root_only(&self) -> TrustRoot {
        TrustRoot::from_der(vec![self.root_der.clone()]).expect("trust root")
    }

    pub(crate) fn root_pem(&self) -> String {
        pem::encode(&pem::Pem::new("CERTIFICATE", self.root_der.clone()))
    }

    pub(crate) fn intermediate_der(&self) -> Option<Vec<u8>> {
        self.intermediate_der.clone()
    }

    /// DER leaf certificate for `key` with `email` as its subject alternative name.
    pub(crate) fn issue_leaf(&self, key: &VerifyingKey, email: &str) -> Vec<u8> {
        self.build_leaf(key, email).to_der().expect("encode leaf")
    }

    fn build_leaf(&self, key: &VerifyingKey, email: &str) -> Certificate {
        let serial = SERIAL.fetch_add(1, Ordering::Relaxed);
        let mut builder = CertificateBuilder::new(
            Profile::Leaf {
                issuer: self.name.clone(),
                enable_key_agreement: false,
                enable_key_encipherment: false,
            },
            SerialNumber::from(serial),
            Validity::from_now(LEAF_LIFETIME).expect("leaf validity"),
            Name::from_str("CN=ephemeral-signer").expect("leaf name"),
            spki(key),
            &self.key,
        )
        .expect("leaf builder");

        let san = SubjectAltName(vec![GeneralName::Rfc822Name(
            Ia5String::new(email).expect("email"),
        )]);
        builder.add_extension(&san).expect("subject alt name");

        builder.build::<DerSignature>().expect("build leaf")
    }
}

#[async_trait]
impl CertificateAuthority for TestAuthority {
    async fn request_certificate(
        &self,
        identity_token: &IdentityToken,
        public_key_pem: &str,
        proof_of_possession: &[u8],
    ) -> Result<EphemeralCertificate> {
        if self.reject {
            bail!("Request failed with status 401 Unauthorized: invalid token");
        }

        let subject = identity_token.subject()?;
        let requested = VerifyingKey::from_public_key_pem(public_key_pem)?;
        let proof = Signature::from_der(proof_of_possession)?;
        requested
            .verify(subject.as_bytes(), &proof)
            .map_err(|_| anyhow!("Proof of possession does not verify"))?;

        let key = if self.wrong_key {
            *SigningKey::random(&mut OsRng).verifying_key()
        } else {
            requested
        };

        let leaf = self.build_leaf(&key, &subject);
        let leaf_pem = leaf.to_pem(LineEnding::LF)?;

        let mut chain = vec![leaf_pem];
        if let Some(der) = &self.intermediate_der {
            chain.push(pem::encode(&pem::Pem::new("CERTIFICATE", der.clone())));
        }
        chain.push(self.root_pem());

        EphemeralCertificate::from_chain(chain)
    }

    async fn trust_bundle(&self) -> Result<TrustRoot> {
        Ok(self.trust_root())
    }
}

/// Append-only log kept in memory that serves real inclusion proofs.
#[derive(Default)]
pub(crate) struct MemoryLog {
    bodies: Mutex<Vec<(Vec<u8>, i64)>>,
    unavailable: bool,
    omit_proofs: bool,
    corrupt_proofs: bool,
    misreport: bool,
    integrated_time: Option<i64>,
}

impl MemoryLog {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Fails every submission and lookup.
    pub(crate) fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    /// Returns entries without inclusion proofs.
    pub(crate) fn without_proofs(mut self) -> Self {
        self.omit_proofs = true;
        self
    }

    /// Returns entries whose proofs do not lead to the stated root.
    pub(crate) fn with_corrupt_proofs(mut self) -> Self {
        self.corrupt_proofs = true;
        self
    }

    /// Answers submissions with an entry for a different digest.
    pub(crate) fn misreporting(mut self) -> Self {
        self.misreport = true;
        self
    }

    /// Stamps every entry with `at` instead of the current time.
    pub(crate) fn integrated_at(mut self, at: i64) -> Self {
        self.integrated_time = Some(at);
        self
    }

    /// Appends an arbitrary record.
    pub(crate) fn append(&self, record: &HashedRekord) -> Result<LogEntry> {
        let body = record.to_body()?;
        let integrated_time = self
            .integrated_time
            .unwrap_or_else(|| chrono::Utc::now().timestamp());

        let mut bodies = self.bodies.lock().expect("log lock");
        bodies.push((body, integrated_time));
        Ok(self.entry_at(&bodies, bodies.len() - 1))
    }

    fn entry_at(&self, bodies: &[(Vec<u8>, i64)], index: usize) -> LogEntry {
        let leaves = bodies
            .iter()
            .map(|(body, _)| merkle::leaf_hash(body))
            .collect::<Vec<_>>();
        let (mut root, proof) = merkle::root_and_proof(&leaves, index);
        if self.corrupt_proofs {
            root[0] ^= 0xff;
        }

        let inclusion_proof = (!self.omit_proofs).then(|| InclusionProof {
            log_index: index as u64,
            tree_size: leaves.len() as u64,
            root_hash: hex::encode(root),
            hashes: proof.iter().map(hex::encode).collect(),
        });

        let (body, integrated_time) = &bodies[index];
        LogEntry {
            uuid: hex::encode(leaves[index]),
            log_index: index as u64,
            log_id: "memory".to_owned(),
            integrated_time: *integrated_time,
            body: BASE64.encode(body),
            inclusion_proof,
            signed_entry_timestamp: None,
        }
    }
}

#[async_trait]
impl TransparencyLog for MemoryLog {
    async fn submit_entry(
        &self,
        digest: &[u8; 32],
        signature: &[u8],
        certificate: &EphemeralCertificate,
    ) -> Result<LogEntry> {
        if self.unavailable {
            bail!("Upload failed with status 503 Service Unavailable");
        }

        let mut record = HashedRekord {
            digest: *digest,
            signature: signature.to_vec(),
            certificate_pem: certificate.leaf_pem.clone(),
        };
        if self.misreport {
            self.append(&record)?;
            record.digest[0] ^= 0xff;
        }

        self.append(&record)
    }

    async fn lookup_entry(&self, digest: &[u8; 32], signature: &[u8]) -> Result<Option<LogEntry>> {
        if self.unavailable {
            bail!("Index search failed with status 503 Service Unavailable");
        }

        let bodies = self.bodies.lock().expect("log lock");
        let index = bodies.iter().position(|(body, _)| {
            HashedRekord::from_body(body)
                .map(|record| record.digest == *digest && record.signature == signature)
                .unwrap_or(false)
        });

        Ok(index.map(|index| self.entry_at(&bodies, index)))
    }
}
