use crate::blob;
use crate::db::DB_FILE;
use anyhow::{anyhow, Context};
use serde_json::json;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const MANIFEST_ENTRY: &str = "manifest.json";
const DB_ENTRY: &str = "db/classroom.sqlite3";
const FILES_ENTRY_PREFIX: &str = "files/";
pub const BUNDLE_FORMAT_V1: &str = "classroom-workspace-v1";

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub bundle_format: String,
    pub entry_count: usize,
    pub blob_count: usize,
}

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub bundle_format: String,
    pub blob_count: usize,
}

/// Relative `a/b/c` paths of every regular file under `root`, sorted.
fn collect_files(root: &Path) -> anyhow::Result<Vec<String>> {
    let mut out = Vec::new();
    if !root.is_dir() {
        return Ok(out);
    }
    let mut stack: Vec<PathBuf> = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for ent in std::fs::read_dir(&dir)
            .with_context(|| format!("failed to read directory {}", dir.to_string_lossy()))?
        {
            let p = ent?.path();
            if p.is_dir() {
                stack.push(p);
                continue;
            }
            let rel = p
                .strip_prefix(root)
                .context("blob escaped files directory")?
                .components()
                .map(|c| c.as_os_str().to_string_lossy().to_string())
                .collect::<Vec<_>>()
                .join("/");
            out.push(rel);
        }
    }
    out.sort();
    Ok(out)
}

pub fn export_workspace_bundle(
    workspace_path: &Path,
    out_path: &Path,
) -> anyhow::Result<ExportSummary> {
    let db_path = workspace_path.join(DB_FILE);
    if !db_path.is_file() {
        return Err(anyhow!(
            "workspace database not found: {}",
            db_path.to_string_lossy()
        ));
    }

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }

    let out_file = File::create(out_path).with_context(|| {
        format!(
            "failed to create output file {}",
            out_path.to_string_lossy()
        )
    })?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let files_root = workspace_path.join(blob::FILES_DIR);
    let blobs = collect_files(&files_root)?;

    let exported_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let manifest = json!({
        "format": BUNDLE_FORMAT_V1,
        "version": 1,
        "appVersion": env!("CARGO_PKG_VERSION"),
        "exportedAt": exported_at,
        "blobCount": blobs.len(),
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
    let mut db_file = File::open(&db_path)
        .with_context(|| format!("failed to open database {}", db_path.to_string_lossy()))?;
    std::io::copy(&mut db_file, &mut zip).context("failed to write database entry")?;

    for rel in &blobs {
        zip.start_file(format!("{FILES_ENTRY_PREFIX}{rel}"), opts)
            .with_context(|| format!("failed to start blob entry {rel}"))?;
        let mut f = File::open(blob::disk_path(workspace_path, rel))
            .with_context(|| format!("failed to open blob {rel}"))?;
        std::io::copy(&mut f, &mut zip).with_context(|| format!("failed to write blob {rel}"))?;
    }

    zip.finish().context("failed to finalize zip bundle")?;

    Ok(ExportSummary {
        bundle_format: BUNDLE_FORMAT_V1.to_string(),
        entry_count: 2 + blobs.len(),
        blob_count: blobs.len(),
    })
}

/// Moves the live database and blob area into `staging/previous`, then
/// moves the staged copies into place. Any failure puts the originals back.
fn swap_in(staging: &Path, live_db: &Path, live_files: &Path) -> anyhow::Result<()> {
    let previous = staging.join("previous");
    std::fs::create_dir_all(&previous).context("failed to create rollback directory")?;
    let old_db = previous.join(DB_FILE);
    let old_files = previous.join(blob::FILES_DIR);
    let had_db = live_db.exists();
    let had_files = live_files.exists();

    let result = (|| -> anyhow::Result<()> {
        if had_db {
            std::fs::rename(live_db, &old_db).context("failed to move existing database aside")?;
        }
        if had_files {
            std::fs::rename(live_files, &old_files).context("failed to move existing files aside")?;
        }
        std::fs::rename(staging.join(DB_FILE), live_db)
            .context("failed to move imported database")?;
        std::fs::rename(staging.join(blob::FILES_DIR), live_files)
            .context("failed to move imported files")?;
        Ok(())
    })();

    if let Err(e) = result {
        restore(&old_db, live_db, had_db, false);
        restore(&old_files, live_files, had_files, true);
        return Err(e);
    }
    Ok(())
}

/// Puts a moved-aside original back, dropping anything half-imported.
fn restore(saved: &Path, live: &Path, existed: bool, is_dir: bool) {
    if !existed || !saved.exists() {
        return;
    }
    if live.exists() {
        let cleared = if is_dir {
            std::fs::remove_dir_all(live)
        } else {
            std::fs::remove_file(live)
        };
        if let Err(e) = cleared {
            tracing::error!(path = %live.display(), error = %e, "failed to clear partial import");
            return;
        }
    }
    if let Err(e) = std::fs::rename(saved, live) {
        tracing::error!(path = %live.display(), error = %e, "failed to restore workspace data");
    }
}

/// Replaces the workspace database and blob area with the bundle contents.
/// The caller must close its connection first.
pub fn import_workspace_bundle(
    in_path: &Path,
    workspace_path: &Path,
) -> anyhow::Result<ImportSummary> {
    std::fs::create_dir_all(workspace_path).with_context(|| {
        format!(
            "failed to create workspace {}",
            workspace_path.to_string_lossy()
        )
    })?;

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
        return Err(anyhow!("unsupported bundle format: {}", format));
    }

    // Stage everything next to the live data, then swap.
    let staging = workspace_path.join(".importing");
    if staging.exists() {
        std::fs::remove_dir_all(&staging).context("failed to clear stale staging directory")?;
    }
    let staged_db = staging.join(DB_FILE);
    let staged_files = staging.join(blob::FILES_DIR);
    std::fs::create_dir_all(&staged_files).context("failed to create staging directory")?;

    {
        let mut db_entry = archive
            .by_name(DB_ENTRY)
            .context("bundle missing db/classroom.sqlite3")?;
        let mut db_out = File::create(&staged_db).context("failed to create staged database")?;
        std::io::copy(&mut db_entry, &mut db_out).context("failed to extract database entry")?;
        db_out.flush().context("failed to flush staged database")?;
    }

    let mut blob_count = 0;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).context("failed to read bundle entry")?;
        let name = entry.name().to_string();
        let Some(rel) = name.strip_prefix(FILES_ENTRY_PREFIX) else {
            continue;
        };
        if entry.is_dir() {
            continue;
        }
        let rel = blob::normalize_path(rel)
            .with_context(|| format!("bundle entry has an unsafe path: {name}"))?;
        let dest = blob::disk_path(&staging, &rel);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&dest)
            .with_context(|| format!("failed to create {}", dest.to_string_lossy()))?;
        std::io::copy(&mut entry, &mut out).with_context(|| format!("failed to extract {name}"))?;
        blob_count += 1;
    }

    let live_db = workspace_path.join(DB_FILE);
    let live_files = workspace_path.join(blob::FILES_DIR);
    swap_in(&staging, &live_db, &live_files)?;
    let _ = std::fs::remove_dir_all(&staging);

    Ok(ImportSummary {
        bundle_format: BUNDLE_FORMAT_V1.to_string(),
        blob_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(prefix: &str) -> PathBuf {
        let p = std::env::temp_dir().join(format!(
            "{}-{}",
            prefix,
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("clock")
                .as_nanos()
        ));
        std::fs::create_dir_all(&p).expect("create temp dir");
        p
    }

    #[test]
    fn bundle_carries_database_and_blobs() {
        let src = temp_dir("classroomd-backup-src");
        let dst = temp_dir("classroomd-backup-dst");
        std::fs::write(src.join(DB_FILE), b"not really sqlite").expect("db");
        let blob_path = blob::disk_path(&src, "submissions/a1/s1/x");
        std::fs::create_dir_all(blob_path.parent().expect("parent")).expect("mkdir");
        std::fs::write(&blob_path, b"essay").expect("blob");

        let bundle = src.join("out").join("bundle.zip");
        let exported = export_workspace_bundle(&src, &bundle).expect("export");
        assert_eq!(exported.blob_count, 1);
        assert_eq!(exported.entry_count, 3);

        std::fs::write(dst.join(DB_FILE), b"old").expect("old db");
        let imported = import_workspace_bundle(&bundle, &dst).expect("import");
        assert_eq!(imported.bundle_format, BUNDLE_FORMAT_V1);
        assert_eq!(imported.blob_count, 1);
        assert_eq!(
            std::fs::read(dst.join(DB_FILE)).expect("read db"),
            b"not really sqlite"
        );
        assert_eq!(
            std::fs::read(blob::disk_path(&dst, "submissions/a1/s1/x")).expect("read blob"),
            b"essay"
        );

        let _ = std::fs::remove_dir_all(src);
        let _ = std::fs::remove_dir_all(dst);
    }

    #[test]
    fn import_replaces_old_blobs_and_cleans_staging() {
        let src = temp_dir("classroomd-backup-replace-src");
        let dst = temp_dir("classroomd-backup-replace-dst");
        std::fs::write(src.join(DB_FILE), b"new db").expect("db");
        let bundle = src.join("bundle.zip");
        export_workspace_bundle(&src, &bundle).expect("export");

        std::fs::write(dst.join(DB_FILE), b"old db").expect("old db");
        let stale = blob::disk_path(&dst, "assignments/c1/stale");
        std::fs::create_dir_all(stale.parent().expect("parent")).expect("mkdir");
        std::fs::write(&stale, b"stale").expect("stale blob");

        let imported = import_workspace_bundle(&bundle, &dst).expect("import");
        assert_eq!(imported.blob_count, 0);
        assert_eq!(std::fs::read(dst.join(DB_FILE)).expect("read db"), b"new db");
        assert!(!stale.exists());
        assert!(dst.join(blob::FILES_DIR).is_dir());
        assert!(!dst.join(".importing").exists());

        let _ = std::fs::remove_dir_all(src);
        let _ = std::fs::remove_dir_all(dst);
    }

    #[test]
    fn failed_swap_restores_live_data() {
        let ws = temp_dir("classroomd-backup-rollback");
        let staging = ws.join(".importing");
        std::fs::create_dir_all(&staging).expect("staging");
        std::fs::write(staging.join(DB_FILE), b"incoming").expect("staged db");
        // No staged files directory, so the second move fails.
        let live_db = ws.join(DB_FILE);
        let live_files = ws.join(blob::FILES_DIR);
        std::fs::write(&live_db, b"live").expect("live db");
        let kept = blob::disk_path(&ws, "submissions/a1/s1/x");
        std::fs::create_dir_all(kept.parent().expect("parent")).expect("mkdir");
        std::fs::write(&kept, b"essay").expect("live blob");

        let err = swap_in(&staging, &live_db, &live_files).expect_err("swap must fail");
        assert!(err.to_string().contains("imported files"));
        assert_eq!(std::fs::read(&live_db).expect("read db"), b"live");
        assert_eq!(std::fs::read(&kept).expect("read blob"), b"essay");

        let _ = std::fs::remove_dir_all(ws);
    }

    #[test]
    fn rejects_foreign_manifest() {
        let dir = temp_dir("classroomd-backup-bad");
        let bundle = dir.join("bad.zip");
        {
            let f = File::create(&bundle).expect("create");
            let mut zip = ZipWriter::new(f);
            zip.start_file(MANIFEST_ENTRY, FileOptions::default())
                .expect("start");
            zip.write_all(br#"{"format":"gradebook-workspace-v2"}"#)
                .expect("write");
            zip.finish().expect("finish");
        }
        let err = import_workspace_bundle(&bundle, &dir.join("ws")).expect_err("must reject");
        assert!(err.to_string().contains("unsupported bundle format"));
        let _ = std::fs::remove_dir_all(dir);
    }
}
