//! File uploads from the browser's upload-modal flow.
//!
//! Grounded on `original_source/viceplugins/retrojsvice/src/upload.cpp`/
//! `.hpp`. `TempDir` creates one process-lifetime scratch directory
//! (`retrojsvicetmp_XXXXXX` under the system temp dir, mirroring the
//! original's `mkdtemp` call) that every `UploadStorage` writes into.
//! `UploadStorage::upload` is a stub in the original (`// TODO:
//! implement`); this crate finishes it — content-addressed by a
//! non-cryptographic hash so repeated uploads of identical bytes under
//! the same name reuse one file on disk, matching the doc comment's
//! promise that `UploadStorage` "deduplicates files that have the same
//! name and content".

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rand::Rng;

use crate::warning_log;

const TEMP_DIR_PREFIX: &str = "retrojsvicetmp_";
const TEMP_DIR_SUFFIX_LEN: usize = 16;
const TEMP_DIR_SUFFIX_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// One process-lifetime scratch directory under the system temp dir.
/// Removed on drop.
pub struct TempDir {
    path: PathBuf,
}

impl TempDir {
    pub fn new() -> io::Result<TempDir> {
        let mut rng = rand::thread_rng();
        for _ in 0..32 {
            let suffix: String = (0..TEMP_DIR_SUFFIX_LEN)
                .map(|_| TEMP_DIR_SUFFIX_ALPHABET[rng.gen_range(0..TEMP_DIR_SUFFIX_ALPHABET.len())] as char)
                .collect();
            let path = std::env::temp_dir().join(format!("{}{}", TEMP_DIR_PREFIX, suffix));
            match std::fs::create_dir(&path) {
                Ok(()) => return Ok(TempDir { path }),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }
        Err(io::Error::new(io::ErrorKind::AlreadyExists, "could not allocate a unique temp dir after 32 attempts"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            warning_log!("deleting temporary directory {:?} failed: {}", self.path, e);
        }
    }
}

/// Strips `/` and NUL from an upload's suggested name, caps it at 200
/// bytes, guards against `.`/`..`/empty names, and ensures the result has an
/// extension, falling back to `.bin` when none is present.
fn sanitize_name(src: &str) -> String {
    let mut ret: String = src.chars().filter(|&c| c != '/' && c != '\0').collect();
    if ret.len() > 200 {
        ret.truncate(200);
    }
    if ret == "." || ret == ".." {
        ret.push_str("_file.bin");
    }
    if ret.is_empty() {
        ret = "file.bin".to_string();
    }
    if !has_extension(&ret) {
        ret.push_str(".bin");
    }
    ret
}

fn has_extension(name: &str) -> bool {
    match name.rfind('.') {
        Some(0) => false,
        Some(idx) => idx < name.len() - 1,
        None => false,
    }
}

fn fnv1a(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &byte in data {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

struct StorageState {
    by_key: HashMap<(String, u64), Arc<PathBuf>>,
    next_file_id: AtomicU64,
}

/// Shared storage for file uploads, deduplicating files with the same
/// sanitized name and content hash. Safe to share between the HTTP worker
/// threads handling concurrent uploads.
pub struct UploadStorage {
    temp_dir: Arc<TempDir>,
    state: Mutex<StorageState>,
}

impl UploadStorage {
    pub fn new(temp_dir: Arc<TempDir>) -> UploadStorage {
        UploadStorage {
            temp_dir,
            state: Mutex::new(StorageState { by_key: HashMap::new(), next_file_id: AtomicU64::new(0) }),
        }
    }

    /// Reads `data` to completion, sanitizes `name`, and returns a handle to
    /// the stored file. Returns `None` if writing to the temp dir fails.
    pub fn upload(self: &Arc<Self>, name: &str, data: &[u8]) -> Option<Arc<FileUpload>> {
        let name = sanitize_name(name);
        let hash = fnv1a(data);
        let key = (name.clone(), hash);

        {
            let state = self.state.lock().unwrap();
            if let Some(path) = state.by_key.get(&key) {
                return Some(Arc::new(FileUpload { storage: Arc::clone(self), path: Arc::clone(path) }));
            }
        }

        let file_id = self.state.lock().unwrap().next_file_id.fetch_add(1, Ordering::Relaxed);
        let path = self.temp_dir.path().join(format!("{:016x}_{}", file_id, name));
        if let Err(e) = write_file(&path, data) {
            warning_log!("writing uploaded file {:?} failed: {}", path, e);
            return None;
        }
        let path = Arc::new(path);

        let mut state = self.state.lock().unwrap();
        let path = state.by_key.entry(key).or_insert(path).clone();
        Some(Arc::new(FileUpload { storage: Arc::clone(self), path }))
    }
}

fn write_file(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(data)
}

/// A single uploaded file's on-disk location. The storage keeps the
/// underlying file alive as long as any `FileUpload` handle (or another
/// upload sharing its content) references it; this crate does not
/// currently garbage-collect deduplicated files early, matching the
/// original's "storage lives for the process" model.
pub struct FileUpload {
    #[allow(dead_code)]
    storage: Arc<UploadStorage>,
    path: Arc<PathBuf>,
}

impl FileUpload {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_to_vec(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        File::open(&*self.path)?.read_to_end(&mut buf)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> Arc<UploadStorage> {
        Arc::new(UploadStorage::new(Arc::new(TempDir::new().unwrap())))
    }

    #[test]
    fn sanitizes_path_separators_and_nuls() {
        // "abc" carries no extension, so the ensure-an-extension step adds one.
        assert_eq!(sanitize_name("a/b\0c"), "abc.bin");
    }

    #[test]
    fn guards_dot_and_dotdot_and_empty() {
        assert_eq!(sanitize_name("."), "._file.bin");
        assert_eq!(sanitize_name(".."), ".._file.bin");
        assert_eq!(sanitize_name(""), "file.bin");
    }

    #[test]
    fn appends_bin_extension_when_missing() {
        assert_eq!(sanitize_name("notes"), "notes.bin");
        assert_eq!(sanitize_name("trailing."), "trailing..bin");
    }

    #[test]
    fn truncates_to_200_bytes_then_appends_missing_extension() {
        let long = "a".repeat(500);
        let sanitized = sanitize_name(&long);
        // The 200-char clamp applies to the raw name before the
        // ensure-an-extension step, so ".bin" lands after it.
        assert_eq!(sanitized.len(), 200 + ".bin".len());
        assert!(sanitized.starts_with(&"a".repeat(200)));
        assert!(sanitized.ends_with(".bin"));
    }

    #[test]
    fn stores_and_reads_back_uploaded_bytes() {
        let storage = storage();
        let upload = storage.upload("notes.txt", b"hello world").unwrap();
        assert_eq!(upload.read_to_vec().unwrap(), b"hello world");
    }

    #[test]
    fn deduplicates_identical_name_and_content() {
        let storage = storage();
        let a = storage.upload("notes.txt", b"same bytes").unwrap();
        let b = storage.upload("notes.txt", b"same bytes").unwrap();
        assert_eq!(a.path(), b.path());
    }

    #[test]
    fn distinct_content_under_the_same_name_gets_distinct_files() {
        let storage = storage();
        let a = storage.upload("notes.txt", b"version one").unwrap();
        let b = storage.upload("notes.txt", b"version two").unwrap();
        assert_ne!(a.path(), b.path());
    }
}
