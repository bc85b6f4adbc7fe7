//! Pre-close snapshots: a zip holding the workspace database and a manifest
//! with its sha256, taken right before a period is finalized.

use anyhow::{anyhow, Context};
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const MANIFEST_ENTRY: &str = "manifest.json";
const DB_ENTRY: &str = "db/lectivo.sqlite3";
pub const SNAPSHOT_FORMAT: &str = "lectivo-period-close-v1";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSummary {
    pub path: String,
    pub format: String,
    pub db_sha256: String,
    pub db_bytes: u64,
}

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

pub fn write_snapshot(
    db_path: &Path,
    out_path: &Path,
    period_id: &str,
) -> anyhow::Result<SnapshotSummary> {
    let db_bytes = std::fs::read(db_path)
        .with_context(|| format!("failed to read database {}", db_path.to_string_lossy()))?;
    let digest = sha256_hex(&db_bytes);

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }
    let out_file = File::create(out_path).with_context(|| {
        format!(
            "failed to create snapshot file {}",
            out_path.to_string_lossy()
        )
    })?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let manifest = json!({
        "format": SNAPSHOT_FORMAT,
        "appVersion": env!("CARGO_PKG_VERSION"),
        "periodId": period_id,
        "takenAt": crate::db::now_rfc3339(),
        "dbSha256": digest,
        "dbBytes": db_bytes.len(),
    });
    zip.start_file(MANIFEST_ENTRY, opts)
        .context("failed to start manifest entry")?;
    zip.write_all(
        serde_json::to_string_pretty(&manifest)
            .context("failed to serialize manifest")?
            .as_bytes(),
    )
    .context("failed to write manifest entry")?;

    zip.start_file(DB_ENTRY, opts)
        .context("failed to start database entry")?;
    zip.write_all(&db_bytes)
        .context("failed to write database entry")?;
    zip.finish().context("failed to finalize snapshot")?;

    tracing::info!(period_id, path = %out_path.display(), "pre-close snapshot written");
    Ok(SnapshotSummary {
        path: out_path.to_string_lossy().to_string(),
        format: SNAPSHOT_FORMAT.to_string(),
        db_sha256: digest,
        db_bytes: db_bytes.len() as u64,
    })
}

/// Re-hashes the database entry and compares it with the manifest.
pub fn verify_snapshot(in_path: &Path) -> anyhow::Result<SnapshotSummary> {
    let in_file = File::open(in_path)
        .with_context(|| format!("failed to open snapshot {}", in_path.to_string_lossy()))?;
    let mut archive = ZipArchive::new(in_file).context("invalid zip archive")?;

    let mut manifest_text = String::new();
    archive
        .by_name(MANIFEST_ENTRY)
        .context("snapshot missing manifest.json")?
        .read_to_string(&mut manifest_text)
        .context("failed to read manifest.json")?;
    let manifest: serde_json::Value =
        serde_json::from_str(&manifest_text).context("manifest.json is invalid JSON")?;
    let format = manifest
        .get("format")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if format != SNAPSHOT_FORMAT {
        return Err(anyhow!("unsupported snapshot format: {}", format));
    }
    let expected = manifest
        .get("dbSha256")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("manifest missing dbSha256"))?
        .to_string();

    let mut db_bytes = Vec::new();
    archive
        .by_name(DB_ENTRY)
        .context("snapshot missing database entry")?
        .read_to_end(&mut db_bytes)
        .context("failed to read database entry")?;
    let actual = sha256_hex(&db_bytes);
    if actual != expected {
        return Err(anyhow!(
            "snapshot checksum mismatch: manifest {} vs content {}",
            expected,
            actual
        ));
    }

    Ok(SnapshotSummary {
        path: in_path.to_string_lossy().to_string(),
        format: format.to_string(),
        db_sha256: actual,
        db_bytes: db_bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(prefix: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("{}-{}", prefix, uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    #[test]
    fn snapshot_round_trips_and_detects_format() {
        let dir = temp_dir("lectivod-snapshot");
        let db = dir.join("lectivo.sqlite3");
        std::fs::write(&db, b"not really sqlite").expect("write db");
        let out = dir.join("out").join("close.zip");

        let written = write_snapshot(&db, &out, "p1").expect("write snapshot");
        assert_eq!(written.db_bytes, 17);
        let verified = verify_snapshot(&out).expect("verify");
        assert_eq!(verified.db_sha256, written.db_sha256);

        let bogus = dir.join("bogus.zip");
        std::fs::write(&bogus, b"PK nope").expect("write bogus");
        assert!(verify_snapshot(&bogus).is_err());
        let _ = std::fs::remove_dir_all(dir);
    }
}
