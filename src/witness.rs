//! Commit witnesses: a canonical, Ed25519-signed envelope binding a diff's
//! identity to an episode and a signer key, carried in commit trailers.
//!
//! The envelope travels inline (gzip + base64url, chunked across repeated
//! `AgentMesh-Witness-Chunk` trailers) so a commit verifies without access to
//! the local store. A sidecar copy under `witnesses/<hex>.json` serves
//! commits written before inline payloads existed.

use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canonical::{digest_hex, files_fingerprint, sha256_tagged, to_canonical_bytes};
use crate::error::{MeshError, Result};
use crate::git::{self, DiffSnapshot};
use crate::keystore::{self, ALGORITHM, Keystore, decode_b64url, encode_b64url};

pub const SCHEMA_VERSION: &str = "cwe_v1";
pub const PAYLOAD_ENCODING: &str = "gzip+base64url";
pub const RAW_ENCODING: &str = "base64url";

pub const TRAILER_EPISODE: &str = "AgentMesh-Episode";
pub const TRAILER_KEY_ID: &str = "AgentMesh-KeyID";
pub const TRAILER_WITNESS: &str = "AgentMesh-Witness";
pub const TRAILER_SIG: &str = "AgentMesh-Sig";
pub const TRAILER_ENCODING: &str = "AgentMesh-Witness-Encoding";
pub const TRAILER_CHUNK_COUNT: &str = "AgentMesh-Witness-Chunk-Count";
pub const TRAILER_CHUNK: &str = "AgentMesh-Witness-Chunk";

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WitnessSigner {
    pub algorithm: String,
    pub key_id: String,
    pub public_key: String,
}

/// The signed preimage. `commit_sha` is not part of it since it changes
/// under rebase and cherry-pick while the diff identity does not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WitnessEnvelope {
    pub schema_version: String,
    pub episode_id: String,
    pub patch_id_stable: String,
    pub patch_hash_verbatim: String,
    pub files_count: usize,
    pub files_hash: String,
    pub agent_id: String,
    pub timestamp: String,
    pub signer: WitnessSigner,
    pub tool_versions: BTreeMap<String, String>,
}

impl WitnessEnvelope {
    /// Build an unsigned envelope for a staged diff.
    pub fn build(
        episode_id: &str,
        agent_id: &str,
        diff: &DiffSnapshot,
        signer: &VerifyingKey,
    ) -> Self {
        let (files_count, files_hash) = files_fingerprint(&diff.files);
        let mut tool_versions = BTreeMap::new();
        tool_versions.insert(
            "agentmesh".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        );
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            episode_id: episode_id.to_string(),
            patch_id_stable: diff.patch_id.clone(),
            patch_hash_verbatim: sha256_tagged(&diff.patch),
            files_count,
            files_hash,
            agent_id: agent_id.to_string(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            signer: WitnessSigner {
                algorithm: ALGORITHM.to_string(),
                key_id: keystore::key_id_for(signer),
                public_key: keystore::encode_public_key(signer),
            },
            tool_versions,
        }
    }
}

/// `sha256:<hex>` over the canonical bytes of a witness.
pub fn witness_hash(canonical: &[u8]) -> String {
    sha256_tagged(canonical)
}

/// A signed envelope plus the values that go into its trailers.
#[derive(Debug, Clone, Serialize)]
pub struct SignedWitness {
    pub envelope: WitnessEnvelope,
    pub witness_hash: String,
    pub signature: String,
    pub key_id: String,
}

/// Sign the canonical bytes of an envelope.
pub fn sign(envelope: WitnessEnvelope, key_id: &str, key: &SigningKey) -> Result<SignedWitness> {
    let canonical = to_canonical_bytes(&envelope)?;
    let signature = key.sign(&canonical);
    Ok(SignedWitness {
        witness_hash: witness_hash(&canonical),
        signature: encode_b64url(&signature.to_bytes()),
        key_id: key_id.to_string(),
        envelope,
    })
}

// ---------------------------------------------------------------------------
// Trailer payload codec
// ---------------------------------------------------------------------------

/// Compress and base64url-encode a witness, split into `chunk_size` pieces.
pub fn encode_payload(witness: &Value, chunk_size: usize) -> Result<Vec<String>> {
    let canonical = to_canonical_bytes(witness)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&canonical)?;
    let encoded = encode_b64url(&encoder.finish()?);

    let size = chunk_size.max(1);
    Ok(encoded
        .as_bytes()
        .chunks(size)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect())
}

/// Reassemble a witness object from trailer chunks. `None` when the chunks
/// do not decode to a JSON object.
pub fn decode_payload(encoding: &str, chunks: &[String]) -> Option<Value> {
    if chunks.is_empty() {
        return None;
    }
    let raw = decode_b64url(&chunks.concat()).ok()?;
    let bytes = match encoding {
        PAYLOAD_ENCODING => {
            let mut out = Vec::new();
            GzDecoder::new(raw.as_slice()).read_to_end(&mut out).ok()?;
            out
        }
        RAW_ENCODING => raw,
        _ => return None,
    };
    let value: Value = serde_json::from_slice(&bytes).ok()?;
    value.is_object().then_some(value)
}

// ---------------------------------------------------------------------------
// Trailers
// ---------------------------------------------------------------------------

/// AgentMesh trailers found in a commit message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Trailers {
    pub episode_id: Option<String>,
    pub key_id: Option<String>,
    pub witness_hash: Option<String>,
    pub signature: Option<String>,
    pub encoding: Option<String>,
    pub chunk_count: Option<String>,
    pub chunks: Vec<String>,
}

impl Trailers {
    /// Scan every line for `Key: value`. Later scalars win; chunks
    /// accumulate in order.
    pub fn parse(message: &str) -> Self {
        let mut trailers = Self::default();
        for line in message.lines() {
            let Some((key, value)) = line.trim().split_once(": ") else {
                continue;
            };
            let value = value.trim().to_string();
            match key {
                TRAILER_EPISODE => trailers.episode_id = Some(value),
                TRAILER_KEY_ID => trailers.key_id = Some(value),
                TRAILER_WITNESS => trailers.witness_hash = Some(value),
                TRAILER_SIG => trailers.signature = Some(value),
                TRAILER_ENCODING => trailers.encoding = Some(value),
                TRAILER_CHUNK_COUNT => trailers.chunk_count = Some(value),
                TRAILER_CHUNK => trailers.chunks.push(value),
                _ => {}
            }
        }
        trailers
    }

    /// Declared chunks, honouring `Chunk-Count` when it parses.
    fn declared_chunks(&self) -> &[String] {
        let count = self
            .chunk_count
            .as_deref()
            .and_then(|raw| raw.trim().parse::<usize>().ok())
            .unwrap_or(self.chunks.len());
        &self.chunks[..count.min(self.chunks.len())]
    }
}

/// Render the trailer block for a signed witness.
pub fn build_trailers(signed: &SignedWitness, chunk_size: usize) -> Result<String> {
    let chunks = encode_payload(&serde_json::to_value(&signed.envelope)?, chunk_size)?;
    let mut lines = vec![
        format!("{TRAILER_EPISODE}: {}", signed.envelope.episode_id),
        format!("{TRAILER_KEY_ID}: {}", signed.key_id),
        format!("{TRAILER_WITNESS}: {}", signed.witness_hash),
        format!("{TRAILER_SIG}: {}", signed.signature),
        format!("{TRAILER_ENCODING}: {PAYLOAD_ENCODING}"),
        format!("{TRAILER_CHUNK_COUNT}: {}", chunks.len()),
    ];
    lines.extend(chunks.iter().map(|c| format!("{TRAILER_CHUNK}: {c}")));
    Ok(lines.join("\n"))
}

/// Append trailers to a commit message, separated by a blank line.
pub fn message_with_trailers(message: &str, trailers: &str) -> String {
    format!("{}\n\n{trailers}\n", message.trim_end())
}

// ---------------------------------------------------------------------------
// Sidecars
// ---------------------------------------------------------------------------

/// Witness copies on disk, one `<hex>.json` per witness hash.
pub struct WitnessSidecars {
    dir: PathBuf,
}

impl WitnessSidecars {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, witness_hash: &str) -> PathBuf {
        self.dir.join(format!("{}.json", digest_hex(witness_hash)))
    }

    pub fn store(&self, witness_hash: &str, witness: &WitnessEnvelope) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path(witness_hash);
        fs::write(&path, serde_json::to_string_pretty(witness)? + "\n")?;
        Ok(path)
    }

    /// Load a sidecar. A missing or unreadable file is `None`.
    pub fn load(&self, witness_hash: &str) -> Option<Value> {
        let raw = fs::read_to_string(self.path(witness_hash)).ok()?;
        serde_json::from_str(&raw).ok()
    }
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Verified,
    NoTrailers,
    WitnessPayloadInvalid,
    WitnessHashMismatch,
    WitnessMissing,
    SignatureInvalid,
    PatchMismatch,
    FilesMismatch,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Verified => "VERIFIED",
            Self::NoTrailers => "NO_TRAILERS",
            Self::WitnessPayloadInvalid => "WITNESS_PAYLOAD_INVALID",
            Self::WitnessHashMismatch => "WITNESS_HASH_MISMATCH",
            Self::WitnessMissing => "WITNESS_MISSING",
            Self::SignatureInvalid => "SIGNATURE_INVALID",
            Self::PatchMismatch => "PATCH_MISMATCH",
            Self::FilesMismatch => "FILES_MISMATCH",
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyOutcome {
    pub commit_sha: String,
    pub verdict: Verdict,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub episode_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub witness_hash: Option<String>,
}

impl VerifyOutcome {
    pub fn ok(&self) -> bool {
        self.verdict == Verdict::Verified
    }

    /// Map a failed verdict onto the error taxonomy.
    pub fn into_result(self) -> Result<Self> {
        let detail = self.detail.clone();
        match self.verdict {
            Verdict::Verified => Ok(self),
            Verdict::NoTrailers | Verdict::WitnessMissing => Err(MeshError::WitnessMissing(detail)),
            Verdict::PatchMismatch => Err(MeshError::PatchMismatch(detail)),
            Verdict::FilesMismatch => Err(MeshError::FilesMismatch(detail)),
            Verdict::SignatureInvalid
            | Verdict::WitnessPayloadInvalid
            | Verdict::WitnessHashMismatch => Err(MeshError::SignatureInvalid(detail)),
        }
    }
}

fn str_field<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(Value::as_str).unwrap_or("").trim()
}

/// Verify a signature over the canonical bytes of `witness`.
///
/// An embedded `signer.public_key` is authoritative, and its derived key id
/// must equal the trailer's key id (or the envelope's own `signer.key_id`
/// when the trailer carries none). Without an embedded key the signer is
/// looked up in the local keystore. Every failure is `false`.
pub fn verify_signature(
    witness: &Value,
    signature_b64: &str,
    trailer_key_id: &str,
    keystore: &Keystore,
) -> bool {
    let Ok(canonical) = to_canonical_bytes(witness) else {
        return false;
    };
    let Some(signature) = decode_b64url(signature_b64)
        .ok()
        .and_then(|raw| <[u8; 64]>::try_from(raw).ok())
        .map(|bytes| Signature::from_bytes(&bytes))
    else {
        return false;
    };

    let signer = witness.get("signer").cloned().unwrap_or(Value::Null);
    let signer_key_id = str_field(&signer, "key_id");
    let embedded = str_field(&signer, "public_key");
    let expected = if trailer_key_id.is_empty() { signer_key_id } else { trailer_key_id };

    let key = if !embedded.is_empty() {
        let Ok(key) = keystore::decode_public_key(embedded) else {
            return false;
        };
        let derived = keystore::key_id_for(&key);
        if !expected.is_empty() && derived != expected {
            return false;
        }
        if !signer_key_id.is_empty() && derived != signer_key_id {
            return false;
        }
        key
    } else {
        if expected.is_empty() {
            return false;
        }
        match keystore.verifying_key(expected) {
            Ok(key) => key,
            Err(_) => return false,
        }
    };

    key.verify(&canonical, &signature).is_ok()
}

/// Verify the witness attached to `rev`. Checks run in a fixed order and the
/// first failure decides the verdict; git or store failures are errors, not
/// verdicts.
pub fn verify_commit(
    repo_root: &Path,
    rev: &str,
    keystore: &Keystore,
    sidecars: &WitnessSidecars,
) -> Result<VerifyOutcome> {
    let view = git::commit_view(repo_root, rev)?;
    let trailers = Trailers::parse(&view.message);

    let mut outcome = VerifyOutcome {
        commit_sha: view.sha.clone(),
        verdict: Verdict::Verified,
        detail: String::new(),
        episode_id: trailers.episode_id.clone(),
        key_id: trailers.key_id.clone(),
        witness_hash: trailers.witness_hash.clone(),
    };
    let verdict = |mut outcome: VerifyOutcome, verdict: Verdict, detail: String| -> Result<VerifyOutcome> {
        if verdict != Verdict::Verified {
            tracing::warn!(commit = %outcome.commit_sha, %verdict, %detail, "witness rejected");
        }
        outcome.verdict = verdict;
        outcome.detail = detail;
        Ok(outcome)
    };

    let (Some(signature), Some(declared_hash)) = (&trailers.signature, &trailers.witness_hash) else {
        return verdict(outcome, Verdict::NoTrailers, "no witness trailers found".into());
    };
    let key_id = trailers.key_id.clone().unwrap_or_default();

    let mut witness = None;
    if let Some(encoding) = trailers.encoding.as_deref().filter(|e| !e.is_empty())
        && !trailers.chunks.is_empty()
    {
        let Some(decoded) = decode_payload(encoding, trailers.declared_chunks()) else {
            return verdict(
                outcome,
                Verdict::WitnessPayloadInvalid,
                "could not decode witness payload from trailers".into(),
            );
        };
        let inline_hash = witness_hash(&to_canonical_bytes(&decoded)?);
        if &inline_hash != declared_hash {
            return verdict(
                outcome,
                Verdict::WitnessHashMismatch,
                format!("trailer={declared_hash}, payload={inline_hash}"),
            );
        }
        witness = Some(decoded);
    }

    let Some(witness) = witness.or_else(|| sidecars.load(declared_hash)) else {
        return verdict(
            outcome,
            Verdict::WitnessMissing,
            format!("witness {declared_hash} not found in trailers or sidecar"),
        );
    };

    if !verify_signature(&witness, signature, &key_id, keystore) {
        return verdict(
            outcome,
            Verdict::SignatureInvalid,
            "Ed25519 signature verification failed".into(),
        );
    }

    let signed_patch_id = str_field(&witness, "patch_id_stable");
    if signed_patch_id.is_empty() {
        return verdict(
            outcome,
            Verdict::WitnessPayloadInvalid,
            "witness does not bind patch_id_stable".into(),
        );
    }
    if signed_patch_id != view.diff.patch_id {
        return verdict(
            outcome,
            Verdict::PatchMismatch,
            format!(
                "patch_id_stable mismatch: witness={signed_patch_id}, recomputed={}",
                view.diff.patch_id
            ),
        );
    }

    let (files_count, files_hash) = files_fingerprint(&view.diff.files);
    if let Some(count) = witness.get("files_count") {
        match count.as_u64() {
            Some(n) if n as usize == files_count => {}
            Some(n) => {
                return verdict(
                    outcome,
                    Verdict::FilesMismatch,
                    format!("files_count mismatch: witness={n}, recomputed={files_count}"),
                );
            }
            None => {
                return verdict(
                    outcome,
                    Verdict::FilesMismatch,
                    "files_count in witness is invalid".into(),
                );
            }
        }
    }
    let signed_files_hash = str_field(&witness, "files_hash");
    if signed_files_hash.is_empty() {
        return verdict(
            outcome,
            Verdict::WitnessPayloadInvalid,
            "witness does not bind files_hash".into(),
        );
    }
    if signed_files_hash != files_hash {
        return verdict(
            outcome,
            Verdict::FilesMismatch,
            format!("files_hash mismatch: witness={signed_files_hash}, recomputed={files_hash}"),
        );
    }

    if outcome.key_id.is_none() {
        outcome.key_id = Some(str_field(&witness["signer"], "key_id").to_string());
    }
    let signer = outcome.key_id.clone().unwrap_or_default();
    verdict(outcome, Verdict::Verified, format!("signed by {signer}"))
}

// ---------------------------------------------------------------------------
// Signing a staged diff
// ---------------------------------------------------------------------------

/// Everything produced when witnessing a staged diff.
#[derive(Debug, Clone, Serialize)]
pub struct StagedWitness {
    pub signed: SignedWitness,
    pub trailers: String,
    pub files: Vec<String>,
    pub sidecar: PathBuf,
}

/// Build, sign and persist a witness for the staged diff.
pub fn witness_staged(
    repo_root: &Path,
    episode_id: &str,
    agent_id: &str,
    keystore: &Keystore,
    key_id: Option<&str>,
    sidecars: &WitnessSidecars,
    chunk_size: usize,
) -> Result<StagedWitness> {
    let (key_id, signing) = keystore.resolve_signer(key_id)?;
    let diff = git::staged_diff(repo_root)?;
    let envelope = WitnessEnvelope::build(episode_id, agent_id, &diff, &signing.verifying_key());
    let signed = sign(envelope, &key_id, &signing)?;
    let sidecar = sidecars.store(&signed.witness_hash, &signed.envelope)?;
    let trailers = build_trailers(&signed, chunk_size)?;
    tracing::debug!(
        witness = %signed.witness_hash,
        files = diff.files.len(),
        patch = %signed.envelope.patch_hash_verbatim,
        "witness signed"
    );
    Ok(StagedWitness {
        signed,
        trailers,
        files: diff.files,
        sidecar,
    })
}
