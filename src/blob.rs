use anyhow::{anyhow, Context};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

pub const FILES_DIR: &str = "files";
pub const URL_PREFIX: &str = "/api/files/";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobMeta {
    pub path: String,
    pub url: String,
    pub original_name: String,
    pub content_type: String,
    pub size: i64,
    pub sha256: String,
    pub created_at: String,
}

/// Accepts either a bare blob path or a `/api/files/...` URL.
pub fn normalize_path(raw: &str) -> anyhow::Result<String> {
    let t = raw.trim();
    let t = t.strip_prefix(URL_PREFIX).unwrap_or(t);
    if t.is_empty() {
        return Err(anyhow!("blob path must not be empty"));
    }
    if t.starts_with('/') || t.contains('\\') {
        return Err(anyhow!("blob path must be relative: {t}"));
    }
    for seg in t.split('/') {
        if seg.is_empty() || seg == "." || seg == ".." {
            return Err(anyhow!("invalid blob path segment in {t}"));
        }
    }
    Ok(t.to_string())
}

pub fn url_for(path: &str) -> String {
    format!("{URL_PREFIX}{path}")
}

pub fn disk_path(workspace: &Path, path: &str) -> PathBuf {
    let mut p = workspace.join(FILES_DIR);
    for seg in path.split('/') {
        p.push(seg);
    }
    p
}

pub fn guess_content_type(name: &str) -> &'static str {
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "pdf" => "application/pdf",
        "txt" | "md" => "text/plain",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "zip" => "application/zip",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        _ => "application/octet-stream",
    }
}

/// Copies `source` into the workspace blob area and records its metadata.
pub fn put(
    conn: &Connection,
    workspace: &Path,
    path: &str,
    source: &Path,
    content_type: Option<&str>,
) -> anyhow::Result<BlobMeta> {
    let path = normalize_path(path)?;
    let original_name = source
        .file_name()
        .and_then(|n| n.to_str())
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow!("source has no file name: {}", source.to_string_lossy()))?;
    let content_type = content_type
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| guess_content_type(&original_name))
        .to_string();

    let dest = disk_path(workspace, &path);
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }

    let mut input = File::open(source)
        .with_context(|| format!("failed to open {}", source.to_string_lossy()))?;
    let mut output = File::create(&dest)
        .with_context(|| format!("failed to create {}", dest.to_string_lossy()))?;
    let mut hasher = Sha256::new();
    let mut size: i64 = 0;
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = input.read(&mut buf).context("failed to read source file")?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        output
            .write_all(&buf[..n])
            .context("failed to write blob")?;
        size += n as i64;
    }
    output.flush().context("failed to flush blob")?;
    let sha256: String = hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect();

    let created_at = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO blobs(path, original_name, content_type, size, sha256, created_at)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(path) DO UPDATE SET
           original_name = excluded.original_name,
           content_type = excluded.content_type,
           size = excluded.size,
           sha256 = excluded.sha256,
           created_at = excluded.created_at",
        (&path, &original_name, &content_type, size, &sha256, &created_at),
    )?;

    Ok(BlobMeta {
        url: url_for(&path),
        path,
        original_name,
        content_type,
        size,
        sha256,
        created_at,
    })
}

pub fn get(conn: &Connection, url_or_path: &str) -> anyhow::Result<Option<BlobMeta>> {
    let path = normalize_path(url_or_path)?;
    let meta = conn
        .query_row(
            "SELECT original_name, content_type, size, sha256, created_at
             FROM blobs WHERE path = ?",
            [&path],
            |r| {
                Ok(BlobMeta {
                    path: path.clone(),
                    url: url_for(&path),
                    original_name: r.get(0)?,
                    content_type: r.get(1)?,
                    size: r.get(2)?,
                    sha256: r.get(3)?,
                    created_at: r.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(meta)
}

/// Removes a single blob. Returns whether a row existed.
pub fn remove(conn: &Connection, workspace: &Path, url_or_path: &str) -> anyhow::Result<bool> {
    let path = normalize_path(url_or_path)?;
    let removed = conn.execute("DELETE FROM blobs WHERE path = ?", [&path])?;
    let file = disk_path(workspace, &path);
    if file.is_file() {
        std::fs::remove_file(&file)
            .with_context(|| format!("failed to remove {}", file.to_string_lossy()))?;
    }
    Ok(removed > 0)
}

/// Removes blob rows and files whose path starts with `prefix/`.
pub fn remove_prefix(conn: &Connection, workspace: &Path, prefix: &str) -> anyhow::Result<usize> {
    let prefix = normalize_path(prefix)?;
    let pattern = format!("{}/%", prefix.replace('%', "\\%").replace('_', "\\_"));
    let removed = conn.execute(
        "DELETE FROM blobs WHERE path LIKE ? ESCAPE '\\'",
        [&pattern],
    )?;
    let dir = disk_path(workspace, &prefix);
    if dir.is_dir() {
        std::fs::remove_dir_all(&dir)
            .with_context(|| format!("failed to remove {}", dir.to_string_lossy()))?;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

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

    fn blobs_db() -> Connection {
        let conn = Connection::open_in_memory().expect("open memory db");
        conn.execute_batch(
            "CREATE TABLE blobs(path TEXT PRIMARY KEY, original_name TEXT NOT NULL,
               content_type TEXT NOT NULL, size INTEGER NOT NULL, sha256 TEXT NOT NULL,
               created_at TEXT NOT NULL);",
        )
        .expect("schema");
        conn
    }

    #[test]
    fn rejects_escaping_paths() {
        assert!(normalize_path("../etc/passwd").is_err());
        assert!(normalize_path("/abs").is_err());
        assert!(normalize_path("a//b").is_err());
        assert!(normalize_path("").is_err());
        assert_eq!(
            normalize_path("/api/files/assignments/c1/x").expect("url form"),
            "assignments/c1/x"
        );
    }

    #[test]
    fn put_then_get_records_digest() {
        let ws = temp_dir("classroomd-blob");
        let src = ws.join("brief.txt");
        std::fs::write(&src, b"abc").expect("write source");
        let conn = blobs_db();

        let meta = put(&conn, &ws, "assignments/c1/one", &src, None).expect("put");
        assert_eq!(meta.url, "/api/files/assignments/c1/one");
        assert_eq!(meta.size, 3);
        assert_eq!(meta.content_type, "text/plain");
        assert_eq!(
            meta.sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(disk_path(&ws, &meta.path).is_file());

        let got = get(&conn, &meta.url).expect("get").expect("present");
        assert_eq!(got.original_name, "brief.txt");
        assert!(get(&conn, "assignments/c1/none").expect("get").is_none());

        assert_eq!(remove_prefix(&conn, &ws, "assignments/c1").expect("remove"), 1);
        assert!(!disk_path(&ws, &meta.path).exists());
        let _ = std::fs::remove_dir_all(ws);
    }

    #[test]
    fn remove_drops_row_and_file() {
        let ws = temp_dir("classroomd-blob-remove");
        let src = ws.join("notes.md");
        std::fs::write(&src, b"# notes").expect("write source");
        let conn = blobs_db();

        let meta = put(&conn, &ws, "submissions/a1/s1/x", &src, Some("text/markdown")).expect("put");
        assert_eq!(meta.content_type, "text/markdown");
        assert!(remove(&conn, &ws, &meta.url).expect("remove"));
        assert!(!disk_path(&ws, &meta.path).exists());
        assert!(get(&conn, &meta.path).expect("get").is_none());
        assert!(!remove(&conn, &ws, &meta.url).expect("second remove"));
        let _ = std::fs::remove_dir_all(ws);
    }
}
