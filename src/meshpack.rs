//! Meshpacks: portable, signed bundles of one episode's provenance.
//!
//! A pack is a deterministic `tar.gz` holding `manifest.json` and four JSONL
//! shards. The manifest records the SHA-256 of every shard; the Ed25519
//! signature covers the SHA-256 of the canonical manifest with its signature
//! fields removed. Packs without `signature_version` are legacy HMAC packs
//! and are refused unless the caller opts in.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use ed25519_dalek::{Signature, Signer as _, Verifier as _, VerifyingKey};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};

use crate::canonical::{sha256_tagged, to_canonical_bytes};
use crate::error::{MeshError, Result};
use crate::keystore::{self, Keystore, decode_b64url, encode_b64url};
use crate::model::{Capsule, Event, EventKind, Message};
use crate::store::capsules::insert_capsule_in;
use crate::store::db::{MeshDb, fmt_ts};
use crate::store::episodes::insert_episode_in;
use crate::store::events::{append_in, insert_imported_in};
use crate::store::messages::insert_message_in;

pub const SIGNATURE_VERSION: &str = "v1";
pub const MANIFEST_FILE: &str = "manifest.json";
pub const CAPSULES_SHARD: &str = "capsules.jsonl";
pub const CLAIMS_SHARD: &str = "claims_snapshot.jsonl";
pub const MESSAGES_SHARD: &str = "messages.jsonl";
pub const WEAVE_SHARD: &str = "weave_slice.jsonl";

/// Shards in archive (and legacy HMAC) order.
pub const SHARDS: [&str; 4] = [CAPSULES_SHARD, CLAIMS_SHARD, MESSAGES_SHARD, WEAVE_SHARD];

/// Manifest fields excluded from the signed digest.
const SIGNATURE_FIELDS: [&str; 5] = [
    "signature_version",
    "signer_key_id",
    "signer_public_key",
    "signature",
    "hmac_legacy",
];

type HmacSha256 = Hmac<Sha256>;

// ---------------------------------------------------------------------------
// Manifest variants
// ---------------------------------------------------------------------------

/// How a pack's manifest claims to be authenticated, decided solely by the
/// presence of `signature_version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackManifest {
    LegacyHmac {
        hmac: Option<String>,
    },
    SignedV1 {
        signer_key_id: String,
        signer_public_key: Option<String>,
        signature: String,
    },
}

fn manifest_str(manifest: &Map<String, Value>, key: &str) -> Option<String> {
    manifest
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

impl PackManifest {
    pub fn classify(manifest: &Map<String, Value>) -> Result<Self> {
        match manifest.get("signature_version") {
            None | Some(Value::Null) => {
                // Packs written before signing existed kept the HMAC in `signature`.
                let hmac = manifest_str(manifest, "hmac_legacy")
                    .or_else(|| manifest_str(manifest, "signature"));
                Ok(Self::LegacyHmac { hmac })
            }
            Some(Value::String(v)) if v == SIGNATURE_VERSION => {
                let (Some(signer_key_id), Some(signature)) = (
                    manifest_str(manifest, "signer_key_id"),
                    manifest_str(manifest, "signature"),
                ) else {
                    return Err(MeshError::SignatureInvalid(
                        "signature_version present but signer_key_id or signature missing".into(),
                    ));
                };
                Ok(Self::SignedV1 {
                    signer_key_id,
                    signer_public_key: manifest_str(manifest, "signer_public_key"),
                    signature,
                })
            }
            Some(other) => Err(MeshError::PackInvalid(format!(
                "unsupported signature_version {other}"
            ))),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::LegacyHmac { .. } => "legacy_hmac",
            Self::SignedV1 { .. } => "signed_v1",
        }
    }
}

/// SHA-256 over the canonical manifest without its signature fields.
pub fn manifest_digest(manifest: &Map<String, Value>) -> Result<[u8; 32]> {
    let mut unsigned = manifest.clone();
    for field in SIGNATURE_FIELDS {
        unsigned.remove(field);
    }
    let canonical = to_canonical_bytes(&Value::Object(unsigned))?;
    Ok(Sha256::digest(&canonical).into())
}

fn legacy_mac(episode_id: &str, shards: &BTreeMap<String, Vec<u8>>) -> Result<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(episode_id.as_bytes())
        .map_err(|e| MeshError::PackInvalid(format!("hmac key: {e}")))?;
    for name in SHARDS {
        if let Some(bytes) = shards.get(name) {
            mac.update(bytes);
        }
    }
    Ok(mac)
}

/// Hex HMAC-SHA256 over the shards, keyed by the episode id.
pub fn legacy_hmac(episode_id: &str, shards: &BTreeMap<String, Vec<u8>>) -> Result<String> {
    Ok(hex::encode(legacy_mac(episode_id, shards)?.finalize().into_bytes()))
}

// ---------------------------------------------------------------------------
// Archive I/O
// ---------------------------------------------------------------------------

/// Decoded pack contents.
#[derive(Debug, Clone)]
pub struct PackContents {
    pub manifest: Map<String, Value>,
    pub shards: BTreeMap<String, Vec<u8>>,
}

impl PackContents {
    pub fn shard(&self, name: &str) -> Result<&[u8]> {
        self.shards
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| MeshError::PackInvalid(format!("{name} missing")))
    }
}

fn pack_io(e: std::io::Error) -> MeshError {
    MeshError::PackInvalid(format!("unreadable archive: {e}"))
}

/// Write a deterministic tar.gz: fixed order, mtime 0, mode 0644, uid/gid 0.
pub fn write_pack(path: &Path, manifest: &Map<String, Value>, shards: &BTreeMap<String, Vec<u8>>) -> Result<()> {
    let manifest_bytes = serde_json::to_vec_pretty(manifest)?;
    let file = File::create(path)?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));

    let mut entries: Vec<(&str, &[u8])> = vec![(MANIFEST_FILE, manifest_bytes.as_slice())];
    for name in SHARDS {
        entries.push((name, shards.get(name).map(Vec::as_slice).unwrap_or_default()));
    }
    for (name, bytes) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_entry_type(tar::EntryType::Regular);
        builder.append_data(&mut header, name, bytes)?;
    }
    builder.into_inner()?.finish()?;
    Ok(())
}

/// Read a pack, requiring exactly the manifest and the four shards.
pub fn read_pack(path: &Path) -> Result<PackContents> {
    let file = File::open(path)?;
    let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
    let mut manifest_bytes = None;
    let mut shards = BTreeMap::new();

    for entry in archive.entries().map_err(pack_io)? {
        let mut entry = entry.map_err(pack_io)?;
        let name = entry.path().map_err(pack_io)?.to_string_lossy().into_owned();
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes).map_err(pack_io)?;

        if name == MANIFEST_FILE {
            if manifest_bytes.replace(bytes).is_some() {
                return Err(MeshError::PackInvalid("duplicate manifest.json".into()));
            }
        } else if SHARDS.contains(&name.as_str()) {
            if shards.insert(name.clone(), bytes).is_some() {
                return Err(MeshError::PackInvalid(format!("duplicate {name}")));
            }
        } else {
            return Err(MeshError::PackInvalid(format!("unexpected entry {name}")));
        }
    }

    let manifest_bytes =
        manifest_bytes.ok_or_else(|| MeshError::PackInvalid("manifest.json missing".into()))?;
    let manifest = match serde_json::from_slice::<Value>(&manifest_bytes) {
        Ok(Value::Object(map)) => map,
        Ok(_) => return Err(MeshError::PackInvalid("manifest is not an object".into())),
        Err(e) => return Err(MeshError::PackInvalid(format!("manifest: {e}"))),
    };
    if let Some(missing) = SHARDS.iter().find(|name| !shards.contains_key(**name)) {
        return Err(MeshError::PackInvalid(format!("{missing} missing")));
    }
    Ok(PackContents { manifest, shards })
}

fn to_jsonl<T: Serialize>(items: &[T]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for item in items {
        out.extend_from_slice(&to_canonical_bytes(item)?);
        out.push(b'\n');
    }
    Ok(out)
}

fn from_jsonl<T: DeserializeOwned>(shard: &str, bytes: &[u8]) -> Result<Vec<T>> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| MeshError::PackInvalid(format!("{shard} is not UTF-8")))?;
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(i, line)| {
            serde_json::from_str(line)
                .map_err(|e| MeshError::PackInvalid(format!("{shard} line {}: {e}", i + 1)))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Export
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ExportReport {
    pub path: PathBuf,
    pub episode_id: String,
    pub signer_key_id: String,
    pub counts: BTreeMap<String, usize>,
}

/// Export `episode_id` to `out`, signed with `key_id` or the default key.
/// `inline_key` embeds the signer's public key so any receiver can verify.
pub fn export(
    db: &MeshDb,
    keystore: &Keystore,
    episode_id: &str,
    key_id: Option<&str>,
    inline_key: bool,
    out: &Path,
) -> Result<ExportReport> {
    let episode = db.get_episode(episode_id)?;
    let (signer_key_id, signing) = keystore.resolve_signer(key_id)?;

    let capsules = db.capsules_for_episode(episode_id)?;
    let claims = db.claims_for_episode(episode_id)?;
    let messages = db.messages_for_episode(episode_id)?;
    let weave = db.events_for_episode(episode_id)?;

    let mut shards = BTreeMap::new();
    shards.insert(CAPSULES_SHARD.to_string(), to_jsonl(&capsules)?);
    shards.insert(CLAIMS_SHARD.to_string(), to_jsonl(&claims)?);
    shards.insert(MESSAGES_SHARD.to_string(), to_jsonl(&messages)?);
    shards.insert(WEAVE_SHARD.to_string(), to_jsonl(&weave)?);

    let counts: BTreeMap<String, usize> = [
        ("capsules", capsules.len()),
        ("claims", claims.len()),
        ("messages", messages.len()),
        ("weave_events", weave.len()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();
    let shard_hashes: Map<String, Value> = shards
        .iter()
        .map(|(name, bytes)| (name.clone(), json!(sha256_tagged(bytes))))
        .collect();

    let mut manifest = Map::new();
    manifest.insert("episode_id".into(), json!(episode.episode_id));
    manifest.insert("title".into(), json!(episode.title));
    manifest.insert("started_at".into(), json!(fmt_ts(episode.started_at)));
    manifest.insert("ended_at".into(), json!(episode.ended_at.map(fmt_ts)));
    manifest.insert("parent_episode_id".into(), json!(episode.parent_episode_id));
    manifest.insert(
        "exported_at".into(),
        json!(Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)),
    );
    manifest.insert("counts".into(), json!(counts));
    manifest.insert("shards".into(), Value::Object(shard_hashes));

    let digest = manifest_digest(&manifest)?;
    let signature = signing.sign(&digest);
    manifest.insert("signature_version".into(), json!(SIGNATURE_VERSION));
    manifest.insert("signer_key_id".into(), json!(signer_key_id));
    if inline_key {
        manifest.insert(
            "signer_public_key".into(),
            json!(keystore::encode_public_key(&signing.verifying_key())),
        );
    }
    manifest.insert("signature".into(), json!(encode_b64url(&signature.to_bytes())));

    write_pack(out, &manifest, &shards)?;
    tracing::info!(episode = %episode_id, key = %signer_key_id, path = %out.display(), "meshpack exported");

    Ok(ExportReport {
        path: out.to_path_buf(),
        episode_id: episode_id.to_string(),
        signer_key_id,
        counts,
    })
}

// ---------------------------------------------------------------------------
// Verify
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub valid: bool,
    pub kind: &'static str,
    pub episode_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signer_key_id: Option<String>,
    pub counts: Value,
}

fn signer_key(
    keystore: &Keystore,
    signer_key_id: &str,
    inline: Option<&str>,
) -> Result<VerifyingKey> {
    match inline {
        Some(raw) => {
            let key = keystore::decode_public_key(raw)
                .map_err(|e| MeshError::SignatureInvalid(format!("inline public key: {e}")))?;
            let derived = keystore::key_id_for(&key);
            if derived != signer_key_id {
                return Err(MeshError::SignatureInvalid(format!(
                    "inline public key is {derived}, manifest names {signer_key_id}"
                )));
            }
            Ok(key)
        }
        None => keystore.verifying_key(signer_key_id).map_err(|e| match e {
            MeshError::KeyNotFound(id) => MeshError::SignatureInvalid(format!(
                "signer {id} is not in the local keystore and no inline key was supplied"
            )),
            other => other,
        }),
    }
}

/// Verify an already-read pack. Every failure is an error; `Ok` means the
/// pack authenticated.
pub fn verify_contents(
    contents: &PackContents,
    keystore: &Keystore,
    accept_legacy: bool,
) -> Result<VerifyReport> {
    let manifest = &contents.manifest;
    let episode_id = manifest_str(manifest, "episode_id")
        .ok_or_else(|| MeshError::PackInvalid("manifest has no episode_id".into()))?;
    let variant = PackManifest::classify(manifest)?;

    let signer_key_id = match &variant {
        PackManifest::LegacyHmac { hmac } => {
            if !accept_legacy {
                tracing::warn!(episode = %episode_id, "legacy meshpack rejected");
                return Err(MeshError::LegacyPackRejected);
            }
            let hmac = hmac
                .as_deref()
                .ok_or_else(|| MeshError::SignatureInvalid("legacy pack carries no HMAC".into()))?;
            let expected = hex::decode(hmac)
                .map_err(|_| MeshError::SignatureInvalid("legacy HMAC is not hex".into()))?;
            legacy_mac(&episode_id, &contents.shards)?
                .verify_slice(&expected)
                .map_err(|_| MeshError::SignatureInvalid("legacy HMAC mismatch".into()))?;
            None
        }
        PackManifest::SignedV1 {
            signer_key_id,
            signer_public_key,
            signature,
        } => {
            let declared = manifest
                .get("shards")
                .and_then(Value::as_object)
                .ok_or_else(|| MeshError::SignatureInvalid("manifest lists no shard hashes".into()))?;
            for name in SHARDS {
                let actual = sha256_tagged(contents.shard(name)?);
                if declared.get(name).and_then(Value::as_str) != Some(actual.as_str()) {
                    return Err(MeshError::SignatureInvalid(format!("{name} hash mismatch")));
                }
            }

            let key = signer_key(keystore, signer_key_id, signer_public_key.as_deref())?;
            let signature: [u8; 64] = decode_b64url(signature)
                .ok()
                .and_then(|raw| raw.try_into().ok())
                .ok_or_else(|| MeshError::SignatureInvalid("signature must be 64 bytes".into()))?;
            key.verify(&manifest_digest(manifest)?, &Signature::from_bytes(&signature))
                .map_err(|_| MeshError::SignatureInvalid("Ed25519 signature does not verify".into()))?;
            Some(signer_key_id.clone())
        }
    };

    Ok(VerifyReport {
        valid: true,
        kind: variant.kind(),
        episode_id,
        signer_key_id,
        counts: manifest.get("counts").cloned().unwrap_or(Value::Null),
    })
}

pub fn verify(path: &Path, keystore: &Keystore, accept_legacy: bool) -> Result<VerifyReport> {
    let report = verify_contents(&read_pack(path)?, keystore, accept_legacy)?;
    tracing::info!(episode = %report.episode_id, kind = report.kind, "meshpack verified");
    Ok(report)
}

// ---------------------------------------------------------------------------
// Import
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportCounts {
    pub episodes: usize,
    pub capsules: usize,
    pub messages: usize,
    pub weave_events: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    pub episode_id: String,
    pub source_episode_id: String,
    pub kind: &'static str,
    pub counts: ImportCounts,
    pub bundle_seq: i64,
}

fn manifest_ts(manifest: &Map<String, Value>, key: &str) -> Result<Option<chrono::DateTime<Utc>>> {
    manifest_str(manifest, key)
        .map(|raw| {
            chrono::DateTime::parse_from_rfc3339(&raw)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| MeshError::PackInvalid(format!("manifest {key}: {e}")))
        })
        .transpose()
}

/// Verify then import a pack in one transaction. Nothing is written unless
/// verification passes. `namespace` prefixes the episode id (`ns/ep_...`).
pub fn import(
    db: &MeshDb,
    keystore: &Keystore,
    path: &Path,
    namespace: Option<&str>,
    agent_id: &str,
    accept_legacy: bool,
) -> Result<ImportReport> {
    let contents = read_pack(path)?;
    let report = verify_contents(&contents, keystore, accept_legacy)?;

    let source_id = report.episode_id.clone();
    let episode_id = match namespace.map(str::trim).filter(|ns| !ns.is_empty()) {
        Some(ns) => format!("{}/{source_id}", ns.trim_end_matches('/')),
        None => source_id.clone(),
    };

    let capsules: Vec<Capsule> = from_jsonl(CAPSULES_SHARD, contents.shard(CAPSULES_SHARD)?)?;
    let messages: Vec<Message> = from_jsonl(MESSAGES_SHARD, contents.shard(MESSAGES_SHARD)?)?;
    let weave: Vec<Event> = from_jsonl(WEAVE_SHARD, contents.shard(WEAVE_SHARD)?)?;

    let episode = crate::model::Episode {
        episode_id: episode_id.clone(),
        title: manifest_str(&contents.manifest, "title").unwrap_or_default(),
        parent_episode_id: manifest_str(&contents.manifest, "parent_episode_id"),
        started_at: manifest_ts(&contents.manifest, "started_at")?.unwrap_or_else(Utc::now),
        ended_at: manifest_ts(&contents.manifest, "ended_at")?,
    };

    let mut counts = ImportCounts::default();
    let tx = db.write_tx()?;
    if insert_episode_in(&tx, &episode)? {
        counts.episodes += 1;
    }
    for mut capsule in capsules {
        capsule.episode_id = Some(episode_id.clone());
        if insert_capsule_in(&tx, &capsule)? {
            counts.capsules += 1;
        }
    }
    for mut message in messages {
        message.episode_id = Some(episode_id.clone());
        if insert_message_in(&tx, &message)? {
            counts.messages += 1;
        }
    }
    for event in &weave {
        if insert_imported_in(&tx, &episode_id, event)? {
            counts.weave_events += 1;
        }
    }
    let bundle = append_in(
        &tx,
        EventKind::Bundle,
        agent_id,
        json!({
            "episode_id": episode_id,
            "source_episode_id": source_id,
            "pack_kind": report.kind,
            "signer_key_id": report.signer_key_id,
            "counts": counts,
        }),
    )?;
    tx.commit()?;

    tracing::info!(episode = %episode_id, ?counts, "meshpack imported");
    Ok(ImportReport {
        episode_id,
        source_episode_id: source_id,
        kind: report.kind,
        counts,
        bundle_seq: bundle.seq,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Severity;
    use crate::store::messages::NewMessage;
    use crate::weave::{NewCapsule, Weave};
    use tempfile::{TempDir, tempdir};

    struct Fixture {
        dir: TempDir,
        db: MeshDb,
        keystore: Keystore,
        episode_id: String,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let db = MeshDb::open_memory().unwrap();
        let keystore = Keystore::new(dir.path().join("keys"), dir.path().join("state.lock"));
        keystore.generate().unwrap();

        let ep = db.start_episode("alice", "pack me", None).unwrap();
        Weave::new(&db)
            .bind_capsule(
                &ep.episode_id,
                NewCapsule {
                    agent_id: "alice".into(),
                    task_desc: "parser".into(),
                    files_changed: vec!["src/parser.rs".into()],
                    ..NewCapsule::default()
                },
            )
            .unwrap();
        db.post_message(&NewMessage {
            from_agent: "alice",
            to_agent: None,
            channel: "general",
            severity: Severity::Handoff,
            body: "parser done",
            episode_id: Some(ep.episode_id.as_str()),
        })
        .unwrap();
        db.end_episode("alice", &ep.episode_id).unwrap();

        Fixture {
            dir,
            db,
            keystore,
            episode_id: ep.episode_id,
        }
    }

    fn rewrite_pack(path: &Path, edit: impl FnOnce(&mut PackContents)) {
        let mut contents = read_pack(path).unwrap();
        edit(&mut contents);
        write_pack(path, &contents.manifest, &contents.shards).unwrap();
    }

    #[test]
    fn export_verifies_and_imports_under_namespace() {
        let fx = fixture();
        let out = fx.dir.path().join("ep.meshpack");
        let exported = export(&fx.db, &fx.keystore, &fx.episode_id, None, true, &out).unwrap();
        assert_eq!(exported.counts["capsules"], 1);
        assert_eq!(exported.counts["messages"], 1);

        let report = verify(&out, &fx.keystore, false).unwrap();
        assert!(report.valid);
        assert_eq!(report.kind, "signed_v1");

        let target = MeshDb::open_memory().unwrap();
        let other_keys = Keystore::new(fx.dir.path().join("empty"), fx.dir.path().join("l"));
        let imported = import(&target, &other_keys, &out, Some("peer"), "bob", false).unwrap();
        assert_eq!(imported.episode_id, format!("peer/{}", fx.episode_id));
        assert_eq!(
            imported.counts,
            ImportCounts {
                episodes: 1,
                capsules: 1,
                messages: 1,
                weave_events: exported.counts["weave_events"],
            }
        );
        assert_eq!(target.capsules_for_episode(&imported.episode_id).unwrap().len(), 1);
        assert_eq!(
            target.imported_events(&imported.episode_id).unwrap().len(),
            exported.counts["weave_events"]
        );
        let bundles = target.tail_events(10, Some(EventKind::Bundle)).unwrap();
        assert_eq!(bundles.len(), 1);
        assert!(target.verify_chain(None, None).unwrap().ok);
    }

    #[test]
    fn export_is_byte_stable_apart_from_exported_at() {
        let fx = fixture();
        let a = fx.dir.path().join("a.meshpack");
        export(&fx.db, &fx.keystore, &fx.episode_id, None, true, &a).unwrap();
        let contents = read_pack(&a).unwrap();
        let b = fx.dir.path().join("b.meshpack");
        write_pack(&b, &contents.manifest, &contents.shards).unwrap();
        assert_eq!(std::fs::read(&a).unwrap(), std::fs::read(&b).unwrap());
    }

    #[test]
    fn tampered_capsule_shard_fails_verification() {
        let fx = fixture();
        let out = fx.dir.path().join("ep.meshpack");
        export(&fx.db, &fx.keystore, &fx.episode_id, None, true, &out).unwrap();
        rewrite_pack(&out, |c| {
            let shard = c.shards.get_mut(CAPSULES_SHARD).unwrap();
            let text = String::from_utf8(shard.clone()).unwrap().replace("parser", "backdoor");
            *shard = text.into_bytes();
        });
        assert!(matches!(
            verify(&out, &fx.keystore, false),
            Err(MeshError::SignatureInvalid(_))
        ));

        // Refreshing the shard hash in the manifest breaks the signature instead.
        rewrite_pack(&out, |c| {
            let hash = sha256_tagged(&c.shards[CAPSULES_SHARD]);
            c.manifest["shards"][CAPSULES_SHARD] = json!(hash);
        });
        assert!(matches!(
            verify(&out, &fx.keystore, false),
            Err(MeshError::SignatureInvalid(_))
        ));

        let target = MeshDb::open_memory().unwrap();
        assert!(import(&target, &fx.keystore, &out, None, "bob", false).is_err());
        assert_eq!(target.event_count().unwrap(), 0);
    }

    #[test]
    fn unknown_signer_without_inline_key_is_rejected() {
        let fx = fixture();
        let out = fx.dir.path().join("ep.meshpack");
        export(&fx.db, &fx.keystore, &fx.episode_id, None, false, &out).unwrap();
        assert!(verify(&out, &fx.keystore, false).is_ok());

        let stranger = Keystore::new(fx.dir.path().join("other"), fx.dir.path().join("l"));
        assert!(matches!(
            verify(&out, &stranger, false),
            Err(MeshError::SignatureInvalid(_))
        ));
    }

    #[test]
    fn inline_key_must_match_declared_signer() {
        let fx = fixture();
        let out = fx.dir.path().join("ep.meshpack");
        export(&fx.db, &fx.keystore, &fx.episode_id, None, true, &out).unwrap();
        rewrite_pack(&out, |c| {
            c.manifest["signer_key_id"] = json!("mesh_0000000000000000");
        });
        assert!(matches!(
            verify(&out, &fx.keystore, false),
            Err(MeshError::SignatureInvalid(_))
        ));
    }

    #[test]
    fn declared_version_without_signature_is_rejected() {
        let fx = fixture();
        let out = fx.dir.path().join("ep.meshpack");
        export(&fx.db, &fx.keystore, &fx.episode_id, None, true, &out).unwrap();
        rewrite_pack(&out, |c| {
            c.manifest.remove("signature");
        });
        assert!(matches!(
            verify(&out, &fx.keystore, false),
            Err(MeshError::SignatureInvalid(_))
        ));
    }

    #[test]
    fn legacy_pack_needs_explicit_opt_in() {
        let fx = fixture();
        let out = fx.dir.path().join("legacy.meshpack");
        export(&fx.db, &fx.keystore, &fx.episode_id, None, true, &out).unwrap();
        rewrite_pack(&out, |c| {
            for field in SIGNATURE_FIELDS {
                c.manifest.remove(field);
            }
            let mac = legacy_hmac(&fx.episode_id, &c.shards).unwrap();
            c.manifest.insert("hmac_legacy".into(), json!(mac));
        });

        let err = verify(&out, &fx.keystore, false).unwrap_err();
        assert!(matches!(err, MeshError::LegacyPackRejected));
        assert_eq!(err.exit_code(), 2);

        let report = verify(&out, &fx.keystore, true).unwrap();
        assert_eq!(report.kind, "legacy_hmac");

        rewrite_pack(&out, |c| {
            c.shards.insert(MESSAGES_SHARD.into(), b"{}\n".to_vec());
        });
        assert!(matches!(
            verify(&out, &fx.keystore, true),
            Err(MeshError::SignatureInvalid(_))
        ));
    }

    #[test]
    fn legacy_pack_without_hmac_is_still_a_legacy_pack() {
        let mut manifest = Map::new();
        manifest.insert("episode_id".into(), json!("ep_old"));
        assert_eq!(
            PackManifest::classify(&manifest).unwrap(),
            PackManifest::LegacyHmac { hmac: None }
        );

        let mut shards = BTreeMap::new();
        for name in SHARDS {
            shards.insert(name.to_string(), Vec::new());
        }
        let contents = PackContents { manifest, shards };
        let dir = tempdir().unwrap();
        let keystore = Keystore::new(dir.path().join("keys"), dir.path().join("l"));

        let err = verify_contents(&contents, &keystore, false).unwrap_err();
        assert!(matches!(err, MeshError::LegacyPackRejected));
        assert_eq!(err.exit_code(), 2);
        assert!(matches!(
            verify_contents(&contents, &keystore, true),
            Err(MeshError::SignatureInvalid(_))
        ));
    }

    #[test]
    fn signed_contents_missing_a_shard_are_malformed() {
        let fx = fixture();
        let out = fx.dir.path().join("ep.meshpack");
        export(&fx.db, &fx.keystore, &fx.episode_id, None, true, &out).unwrap();
        let mut contents = read_pack(&out).unwrap();
        contents.shards.remove(WEAVE_SHARD);

        let err = verify_contents(&contents, &fx.keystore, false).unwrap_err();
        assert!(matches!(err, MeshError::PackInvalid(_)));
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn missing_shard_is_malformed() {
        let fx = fixture();
        let out = fx.dir.path().join("bad.meshpack");
        let file = File::create(&out).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        let bytes = serde_json::to_vec(&json!({"episode_id": "ep_x"})).unwrap();
        let mut header = tar::Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, MANIFEST_FILE, bytes.as_slice()).unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let err = verify(&out, &fx.keystore, false).unwrap_err();
        assert!(matches!(err, MeshError::PackInvalid(_)));
        assert_eq!(err.exit_code(), 3);
    }
}
