use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHash {
    pub filename: String,
    pub hash: String,
    pub size: u64,
}

/// Content fingerprint of a built tool: its tracked sources and the compiled binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityRecord {
    pub source_hash: String,
    pub binary_hash: Option<String>,
    pub files: Vec<FileHash>,
}

/// Which files in a tool directory count as source for hashing purposes.
#[derive(Debug, Clone)]
pub struct SourceSelector {
    pub extensions: Vec<String>,
    pub file_names: Vec<String>,
}

impl SourceSelector {
    fn matches(&self, path: &Path) -> bool {
        let ext_match = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| self.extensions.iter().any(|want| want == ext));
        let name_match = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| self.file_names.iter().any(|want| want == name));
        ext_match || name_match
    }
}

pub async fn compute_integrity(
    tool_dir: &Path,
    binary_name: &str,
    selector: &SourceSelector,
) -> Result<IntegrityRecord> {
    let dir = tool_dir.to_path_buf();
    let binary = tool_dir.join(binary_name);
    let selector = selector.clone();
    tokio::task::spawn_blocking(move || -> Result<IntegrityRecord> {
        let (source_hash, files) = hash_source_dir(&dir, &selector)?;
        // A missing binary still yields a usable source fingerprint.
        let binary_hash = hash_file(&binary).ok();
        Ok(IntegrityRecord {
            source_hash,
            binary_hash,
            files,
        })
    })
    .await
    .context("join integrity hashing task")?
}

/// Hashes every selected file below `root`, sorted by relative path, and folds the
/// per-file digests into one overall source hash.
pub fn hash_source_dir(root: &Path, selector: &SourceSelector) -> Result<(String, Vec<FileHash>)> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries =
            std::fs::read_dir(&dir).with_context(|| format!("read dir {}", dir.display()))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
            let path = entry.path();
            let file_type = entry
                .file_type()
                .with_context(|| format!("stat {}", path.display()))?;
            if file_type.is_dir() {
                pending.push(path);
                continue;
            }
            if !file_type.is_file() || !selector.matches(&path) {
                continue;
            }
            let relative = relative_name(root, &path);
            let hash = hash_file(&path).with_context(|| format!("hash {relative}"))?;
            let size = entry.metadata().map(|meta| meta.len()).unwrap_or_default();
            files.push(FileHash {
                filename: relative,
                hash,
                size,
            });
        }
    }
    files.sort_by(|a, b| a.filename.cmp(&b.filename));

    let mut overall = Sha256::new();
    for file in &files {
        overall.update(format!("{}:{}\n", file.filename, file.hash).as_bytes());
    }
    Ok((hex_encode(overall.finalize().as_slice()), files))
}

pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex_encode(hasher.finalize().as_slice()))
}

/// Re-hashes `tool_dir` and compares it to `expected`. The binary is only compared
/// when the stored record has a binary hash.
pub fn verify_integrity(
    tool_dir: &Path,
    binary_name: &str,
    selector: &SourceSelector,
    expected: &IntegrityRecord,
) -> Result<bool> {
    let (source_hash, _) = hash_source_dir(tool_dir, selector)?;
    if !source_hash.eq_ignore_ascii_case(&expected.source_hash) {
        return Ok(false);
    }
    if let Some(expected_binary) = expected.binary_hash.as_deref() {
        let binary: PathBuf = tool_dir.join(binary_name);
        let actual = hash_file(&binary).with_context(|| format!("hash {}", binary.display()))?;
        if !actual.eq_ignore_ascii_case(expected_binary) {
            return Ok(false);
        }
    }
    Ok(true)
}

/// True when the sources no longer match `expected_source_hash`. An unreadable
/// directory counts as tampered; an empty expectation never does.
pub fn is_tampered(tool_dir: &Path, selector: &SourceSelector, expected_source_hash: &str) -> bool {
    if expected_source_hash.trim().is_empty() {
        return false;
    }
    match hash_source_dir(tool_dir, selector) {
        Ok((current, _)) => !current.eq_ignore_ascii_case(expected_source_hash.trim()),
        Err(_) => true,
    }
}

fn relative_name(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::temp_dir;

    fn go_selector() -> SourceSelector {
        SourceSelector {
            extensions: vec!["go".to_owned()],
            file_names: vec!["go.mod".to_owned(), "manifest.json".to_owned()],
        }
    }

    #[test]
    fn hash_file_matches_known_sha256() {
        let dir = temp_dir("known");
        let path = dir.join("hello.txt");
        std::fs::write(&path, b"hello").expect("write");
        assert_eq!(
            hash_file(&path).expect("hash"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn source_hash_tracks_only_selected_files_in_sorted_order() {
        let dir = temp_dir("select");
        std::fs::create_dir_all(dir.join("pkg")).expect("mkdir");
        std::fs::write(dir.join("main.go"), "package main").expect("write");
        std::fs::write(dir.join("pkg/util.go"), "package pkg").expect("write");
        std::fs::write(dir.join("go.mod"), "module x").expect("write");
        std::fs::write(dir.join("tool.log"), "noise").expect("write");

        let (first, files) = hash_source_dir(&dir, &go_selector()).expect("hash");
        let names = files.iter().map(|f| f.filename.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["go.mod", "main.go", "pkg/util.go"]);
        assert_eq!(files[1].size, "package main".len() as u64);

        std::fs::write(dir.join("tool.log"), "more noise").expect("write");
        let (second, _) = hash_source_dir(&dir, &go_selector()).expect("hash");
        assert_eq!(first, second);

        std::fs::write(dir.join("main.go"), "package main // edited").expect("write");
        assert!(is_tampered(&dir, &go_selector(), &first));
        assert!(!is_tampered(&dir, &go_selector(), ""));
    }

    #[tokio::test]
    async fn verify_detects_binary_swap() {
        let dir = temp_dir("verify");
        std::fs::write(dir.join("main.go"), "package main").expect("write");
        std::fs::write(dir.join("tool"), b"\x7fELF-original").expect("write");

        let record = compute_integrity(&dir, "tool", &go_selector())
            .await
            .expect("integrity");
        assert!(record.binary_hash.is_some());
        assert!(verify_integrity(&dir, "tool", &go_selector(), &record).expect("verify"));

        std::fs::write(dir.join("tool"), b"\x7fELF-swapped").expect("write");
        assert!(!verify_integrity(&dir, "tool", &go_selector(), &record).expect("verify"));
    }
}
