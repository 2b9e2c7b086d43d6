//! Snapshot file persistence.
//!
//! The snapshot is the JSON image of the whole tree plus the
//! `checkpoint_lsn` it reflects. It is always written atomically:
//! serialize to `<path>.tmp`, fsync, rename over `<path>`, fsync the
//! parent directory. With an encryption key configured the serialized
//! JSON passes through the [`crate::crypto::SnapshotCipher`] envelope.
//!
//! On load, a bare JSON tree (no envelope) is accepted with
//! `checkpoint_lsn` 0, so hand-written database files work.

use crate::crypto::SnapshotCipher;
use crate::error::{CoreError, CoreResult};
use crate::types::Lsn;
use dotdb_codec::{from_json, Value};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path as StdPath, PathBuf};

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    root: &'a Value,
    checkpoint_lsn: u64,
}

#[derive(Deserialize)]
struct Envelope {
    root: Value,
    checkpoint_lsn: u64,
}

/// Loads the snapshot, returning the root and its checkpoint LSN.
///
/// Returns `None` if the file does not exist.
///
/// # Errors
///
/// Returns `Corruption` if the file cannot be parsed (or decrypted),
/// and `Type` via the caller's invariant if the root is not an object.
pub fn load(path: &StdPath, cipher: Option<&SnapshotCipher>) -> CoreResult<Option<(Value, Lsn)>> {
    if !path.exists() {
        return Ok(None);
    }

    let raw = fs::read_to_string(path)?;
    let plaintext = match cipher {
        Some(cipher) => String::from_utf8(cipher.open(&raw)?)
            .map_err(|_| CoreError::corruption("decrypted snapshot is not UTF-8"))?,
        None => raw,
    };

    // Prefer the envelope; fall back to a bare tree at checkpoint 0.
    if let Ok(envelope) = serde_json::from_str::<Envelope>(&plaintext) {
        if envelope.root.is_object() {
            return Ok(Some((envelope.root, Lsn::new(envelope.checkpoint_lsn))));
        }
    }

    let root = from_json(&plaintext)
        .map_err(|e| CoreError::corruption(format!("snapshot parse failed: {e}")))?;
    if !root.is_object() {
        return Err(CoreError::corruption(format!(
            "snapshot root must be an object, got {}",
            root.type_name()
        )));
    }
    Ok(Some((root, Lsn::ZERO)))
}

/// Serializes the snapshot and writes it to `<path>.tmp`, fsynced.
///
/// This is the slow half of a checkpoint and runs without blocking
/// writers; [`promote`] swaps the staged file in.
pub fn stage(
    path: &StdPath,
    root: &Value,
    checkpoint_lsn: Lsn,
    cipher: Option<&SnapshotCipher>,
) -> CoreResult<()> {
    let envelope = EnvelopeRef {
        root,
        checkpoint_lsn: checkpoint_lsn.as_u64(),
    };
    let json = serde_json::to_string_pretty(&envelope)
        .map_err(|e| CoreError::corruption(format!("snapshot encode failed: {e}")))?;

    let bytes = match cipher {
        Some(cipher) => cipher.seal(json.as_bytes())?.into_bytes(),
        None => json.into_bytes(),
    };

    let tmp = tmp_path(path);
    let mut file = File::create(&tmp)?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    Ok(())
}

/// Renames the staged file over the snapshot and fsyncs the directory.
pub fn promote(path: &StdPath) -> CoreResult<()> {
    fs::rename(tmp_path(path), path)?;
    sync_parent_dir(path)?;
    Ok(())
}

fn tmp_path(path: &StdPath) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

/// Fsyncs the parent directory so the rename is durable.
#[cfg(unix)]
fn sync_parent_dir(path: &StdPath) -> CoreResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            File::open(parent)?.sync_all()?;
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &StdPath) -> CoreResult<()> {
    // NTFS journaling covers metadata durability for renames.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dotdb_codec::from_json;
    use tempfile::tempdir;

    fn store(path: &StdPath, root: &Value, lsn: Lsn, cipher: Option<&SnapshotCipher>) {
        stage(path, root, lsn, cipher).unwrap();
        promote(path).unwrap();
    }

    #[test]
    fn missing_file_is_none() {
        let dir = tempdir().unwrap();
        assert!(load(&dir.path().join("db.json"), None).unwrap().is_none());
    }

    #[test]
    fn store_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.json");
        let root = from_json(r#"{"users":{"alice":{"n":1}}}"#).unwrap();

        store(&path, &root, Lsn::new(17), None);
        let (loaded, lsn) = load(&path, None).unwrap().unwrap();

        assert_eq!(loaded, root);
        assert_eq!(lsn, Lsn::new(17));
        assert!(!dir.path().join("db.json.tmp").exists());
    }

    #[test]
    fn bare_tree_loads_at_checkpoint_zero() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.json");
        fs::write(&path, r#"{"hand":{"written":true}}"#).unwrap();

        let (loaded, lsn) = load(&path, None).unwrap().unwrap();
        assert_eq!(loaded, from_json(r#"{"hand":{"written":true}}"#).unwrap());
        assert_eq!(lsn, Lsn::ZERO);
    }

    #[test]
    fn corrupt_snapshot_fails_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.json");
        fs::write(&path, "{definitely not json").unwrap();

        assert!(matches!(
            load(&path, None),
            Err(CoreError::Corruption { .. })
        ));
    }

    #[test]
    fn non_object_root_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.json");
        fs::write(&path, "[1,2,3]").unwrap();

        assert!(matches!(
            load(&path, None),
            Err(CoreError::Corruption { .. })
        ));
    }

    #[test]
    fn encrypted_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.json");
        let cipher = SnapshotCipher::new("passphrase");
        let root = from_json(r#"{"secret":{"v":42}}"#).unwrap();

        store(&path, &root, Lsn::new(3), Some(&cipher));

        // The file on disk is a hex stream, not JSON.
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.bytes().all(|b| b.is_ascii_hexdigit()));

        let (loaded, lsn) = load(&path, Some(&cipher)).unwrap().unwrap();
        assert_eq!(loaded, root);
        assert_eq!(lsn, Lsn::new(3));
    }

    #[test]
    fn encrypted_load_without_key_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("db.json");
        let cipher = SnapshotCipher::new("passphrase");
        store(&path, &Value::object(), Lsn::ZERO, Some(&cipher));

        assert!(load(&path, None).is_err());
    }
}
