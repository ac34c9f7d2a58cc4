use anyhow::{anyhow, Context};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const DB_FILE_NAME: &str = "classdiary.sqlite3";
const MANIFEST_ENTRY: &str = "manifest.json";
const DB_ENTRY: &str = "db/classdiary.sqlite3";
pub const BUNDLE_FORMAT_V1: &str = "classdiary-workspace-v1";
pub const RAW_SQLITE_FORMAT: &str = "raw-sqlite3";

/// Tables every class diary database carries, whatever its age.
const DIARY_TABLES: [&str; 6] = [
    "settings",
    "students",
    "subjects",
    "lessons",
    "attendance",
    "grades",
];
const KNOWN_VARIANTS: [&str; 2] = ["basic", "higher"];

/// Reasons a restore is refused. The target database is untouched in every case.
#[derive(Debug, thiserror::Error)]
pub enum RestoreRejected {
    #[error("database checksum mismatch (manifest {expected}, bundle {actual})")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("not a class diary database: {0}")]
    NotADiary(String),
    #[error("bundle holds a {bundle} workspace but the target is pinned to {workspace}")]
    VariantMismatch { bundle: String, workspace: String },
}

/// What a diary database holds, as recorded in a bundle manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiarySnapshot {
    pub variant: Option<String>,
    pub students: i64,
    pub subjects: i64,
    pub lessons: i64,
    pub grades: i64,
}

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub bundle_format: String,
    pub entry_count: usize,
    pub db_sha256: String,
    pub snapshot: DiarySnapshot,
}

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub bundle_format_detected: String,
    pub db_sha256: String,
    pub snapshot: DiarySnapshot,
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

fn count_rows(conn: &Connection, table: &str) -> rusqlite::Result<i64> {
    conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))
}

/// Opens `path` and checks it is a diary database: every diary table present
/// and, if a variant is pinned, a known one. The connection is closed on return.
pub fn inspect_database(path: &Path) -> Result<DiarySnapshot, RestoreRejected> {
    let rejected = |e: rusqlite::Error| RestoreRejected::NotADiary(e.to_string());
    let conn = Connection::open(path).map_err(rejected)?;

    // The first read is where SQLite notices a file that is not a database.
    let mut stmt = conn
        .prepare("SELECT name FROM sqlite_master WHERE type = 'table'")
        .map_err(rejected)?;
    let tables = stmt
        .query_map([], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(rejected)?;
    drop(stmt);
    if let Some(missing) = DIARY_TABLES
        .iter()
        .find(|t| !tables.iter().any(|name| name.as_str() == **t))
    {
        return Err(RestoreRejected::NotADiary(format!(
            "missing table {}",
            missing
        )));
    }

    let school: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = 'school'",
            [],
            |r| r.get(0),
        )
        .optional()
        .map_err(rejected)?;
    let variant = match school {
        Some(raw) => serde_json::from_str::<serde_json::Value>(&raw)
            .map_err(|e| RestoreRejected::NotADiary(format!("unreadable school settings: {}", e)))?
            .get("variant")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        None => None,
    };
    if let Some(v) = variant.as_deref() {
        if !KNOWN_VARIANTS.contains(&v) {
            return Err(RestoreRejected::NotADiary(format!(
                "unknown school variant {:?}",
                v
            )));
        }
    }

    Ok(DiarySnapshot {
        variant,
        students: count_rows(&conn, "students").map_err(rejected)?,
        subjects: count_rows(&conn, "subjects").map_err(rejected)?,
        lessons: count_rows(&conn, "lessons").map_err(rejected)?,
        grades: count_rows(&conn, "grades").map_err(rejected)?,
    })
}

pub fn export_workspace_bundle(
    workspace_path: &Path,
    out_path: &Path,
) -> anyhow::Result<ExportSummary> {
    let db_path = workspace_path.join(DB_FILE_NAME);
    if !db_path.is_file() {
        return Err(anyhow!(
            "workspace database not found: {}",
            db_path.to_string_lossy()
        ));
    }
    let snapshot = inspect_database(&db_path)
        .with_context(|| format!("refusing to export {}", db_path.to_string_lossy()))?;
    let db_bytes = std::fs::read(&db_path)
        .with_context(|| format!("failed to read database {}", db_path.to_string_lossy()))?;
    let db_sha256 = sha256_hex(&db_bytes);

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }
    let out_file = File::create(out_path)
        .with_context(|| format!("failed to create bundle {}", out_path.to_string_lossy()))?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let manifest = json!({
        "format": BUNDLE_FORMAT_V1,
        "version": 1,
        "appVersion": env!("CARGO_PKG_VERSION"),
        "exportedAt": chrono::Utc::now().to_rfc3339(),
        "dbSha256": db_sha256,
        "diary": snapshot,
    });
    zip.start_file(MANIFEST_ENTRY, opts)
        .context("failed to start manifest entry")?;
    zip.write_all(serde_json::to_string_pretty(&manifest)?.as_bytes())
        .context("failed to write manifest entry")?;
    zip.start_file(DB_ENTRY, opts)
        .context("failed to start database entry")?;
    zip.write_all(&db_bytes)
        .context("failed to write database entry")?;
    zip.finish().context("failed to finalize bundle")?;

    Ok(ExportSummary {
        bundle_format: BUNDLE_FORMAT_V1.to_string(),
        entry_count: 2,
        db_sha256,
        snapshot,
    })
}

/// Reads the database bytes out of a bundle, checked against its manifest.
fn read_bundle_db(in_path: &Path) -> anyhow::Result<(Vec<u8>, String)> {
    let in_file = File::open(in_path)
        .with_context(|| format!("failed to open bundle {}", in_path.to_string_lossy()))?;
    let mut archive = ZipArchive::new(in_file).context("invalid zip archive")?;

    let mut manifest_text = String::new();
    archive
        .by_name(MANIFEST_ENTRY)
        .context("bundle missing manifest.json")?
        .read_to_string(&mut manifest_text)
        .context("failed to read manifest.json")?;
    let manifest: serde_json::Value =
        serde_json::from_str(&manifest_text).context("manifest.json is invalid JSON")?;
    let format = manifest
        .get("format")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if format != BUNDLE_FORMAT_V1 {
        return Err(anyhow!("unsupported bundle format: {:?}", format));
    }
    let expected = manifest
        .get("dbSha256")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("manifest.json missing dbSha256"))?
        .to_ascii_lowercase();

    let mut db_bytes = Vec::new();
    archive
        .by_name(DB_ENTRY)
        .context("bundle missing db/classdiary.sqlite3")?
        .read_to_end(&mut db_bytes)
        .context("failed to extract database entry")?;
    let actual = sha256_hex(&db_bytes);
    if actual != expected {
        return Err(RestoreRejected::ChecksumMismatch { expected, actual }.into());
    }
    Ok((db_bytes, actual))
}

fn stage(tmp: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    if tmp.exists() {
        std::fs::remove_file(tmp)
            .with_context(|| format!("failed to clear {}", tmp.to_string_lossy()))?;
    }
    let mut out = File::create(tmp)
        .with_context(|| format!("failed to create {}", tmp.to_string_lossy()))?;
    out.write_all(bytes)
        .and_then(|_| out.sync_all())
        .with_context(|| format!("failed to write {}", tmp.to_string_lossy()))?;
    Ok(())
}

/// Variant the database already at `dst` is pinned to. A target that is
/// missing or unreadable pins nothing and may be overwritten.
fn pinned_variant(dst: &Path) -> Option<String> {
    if !dst.is_file() {
        return None;
    }
    inspect_database(dst).ok().and_then(|s| s.variant)
}

/// Restores a bundle (or a bare diary database) into `workspace_path`. The
/// incoming database is staged beside the target and only renamed over it
/// once it reads as a diary whose variant agrees with the target's.
pub fn import_workspace_bundle(
    in_path: &Path,
    workspace_path: &Path,
) -> anyhow::Result<ImportSummary> {
    let (bytes, db_sha256, format) = if is_zip_file(in_path)? {
        let (bytes, sha) = read_bundle_db(in_path)?;
        (bytes, sha, BUNDLE_FORMAT_V1)
    } else {
        let bytes = std::fs::read(in_path)
            .with_context(|| format!("failed to read {}", in_path.to_string_lossy()))?;
        let sha = sha256_hex(&bytes);
        (bytes, sha, RAW_SQLITE_FORMAT)
    };

    std::fs::create_dir_all(workspace_path).with_context(|| {
        format!(
            "failed to create workspace {}",
            workspace_path.to_string_lossy()
        )
    })?;
    let dst = workspace_path.join(DB_FILE_NAME);
    let tmp: PathBuf = workspace_path.join(format!("{}.importing", DB_FILE_NAME));
    stage(&tmp, &bytes)?;

    let checked = inspect_database(&tmp).and_then(|snapshot| {
        if let (Some(bundle), Some(workspace)) = (snapshot.variant.clone(), pinned_variant(&dst)) {
            if bundle != workspace {
                return Err(RestoreRejected::VariantMismatch { bundle, workspace });
            }
        }
        Ok(snapshot)
    });
    let snapshot = match checked {
        Ok(s) => s,
        Err(e) => {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
    };

    std::fs::rename(&tmp, &dst).with_context(|| {
        format!(
            "failed to move restored database to {}",
            dst.to_string_lossy()
        )
    })?;

    Ok(ImportSummary {
        bundle_format_detected: format.to_string(),
        db_sha256,
        snapshot,
    })
}

fn is_zip_file(path: &Path) -> anyhow::Result<bool> {
    let mut f = File::open(path)
        .with_context(|| format!("failed to open input file {}", path.to_string_lossy()))?;
    let mut sig = [0u8; 4];
    let read = f.read(&mut sig).context("failed to read file signature")?;
    Ok(read == 4 && sig == [0x50, 0x4B, 0x03, 0x04])
}
