//! Host-provided file downloads served back through HTTP.
//!
//! Grounded on
//! `original_source/viceplugins/retrojsvice/src/download.cpp`/`.hpp`. A
//! `FileDownload` wraps a path the host already wrote to disk plus a
//! cleanup callback (typically deleting that path) that runs when the
//! `FileDownload` itself is dropped — mirroring the original's
//! destructor-driven cleanup. Window-level bookkeeping (the hashed
//! cacheable URL and its 30-second TTL) lives in `window.rs`; this module
//! only covers sanitizing the suggested filename and streaming the file
//! back.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;

use crate::error_log;

fn extract_extension(filename: &str) -> (String, String) {
    if let Some(last_dot) = filename.rfind('.') {
        let ext = &filename[last_dot + 1..];
        let ext_len = ext.len();
        if (1..=5).contains(&ext_len) && ext.bytes().all(|c| c.is_ascii_alphanumeric()) {
            return (filename[..last_dot].to_string(), ext.to_string());
        }
    }
    (filename.to_string(), "bin".to_string())
}

fn sanitize_base(base: &str) -> String {
    let mut ret = String::new();
    for c in base.chars() {
        if c.is_ascii_alphanumeric() {
            ret.push(c);
        } else if !ret.is_empty() && !ret.ends_with('_') {
            ret.push('_');
        }
    }
    if ret.is_empty() || !ret.chars().next().unwrap().is_ascii_alphabetic() {
        ret = format!("file_{}", ret);
    }
    ret.truncate(32);
    if ret.ends_with('_') {
        ret.pop();
    }
    ret
}

/// Sanitizes a host-suggested download filename: the base name is reduced
/// to `[a-zA-Z0-9_]`, forced to start with a letter, and capped at 32
/// characters; the extension (if it looks like one) is kept as-is,
/// otherwise replaced with `bin`.
pub fn sanitize_filename(filename: &str) -> String {
    let (base, ext) = extract_extension(filename);
    format!("{}.{}", sanitize_base(&base), ext)
}

/// Anything able to carry a downloaded file back to the client. Defined
/// here rather than depending on the HTTP layer directly.
pub trait DownloadResponder: Send + 'static {
    fn respond_with_file(
        &self,
        content_length: u64,
        content_disposition_filename: &str,
        write_body: Box<dyn FnOnce(&mut dyn Write) + Send>,
    );
    fn respond_with_server_error(&self);
}

/// A file the host has made available for download (image_compressor's sibling
/// feature to uploads; surfaced to the host through the C ABI's
/// `putFileDownload`).
pub struct FileDownload {
    name: String,
    path: PathBuf,
    cleanup: Option<Box<dyn FnOnce() + Send>>,
}

impl FileDownload {
    pub fn new(name: &str, path: PathBuf, cleanup: impl FnOnce() + Send + 'static) -> FileDownload {
        FileDownload { name: sanitize_filename(name), path, cleanup: Some(Box::new(cleanup)) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Serves the file as an HTTP response. Headers intentionally omit
    /// `Cache-Control: no-cache` (matching the original) so legacy clients
    /// may cache the response.
    pub fn serve(&self, responder: &dyn DownloadResponder) {
        let length = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(e) => {
                error_log!("determining the size of downloaded file {:?} failed: {}", self.path, e);
                responder.respond_with_server_error();
                return;
            }
        };

        let path = self.path.clone();
        let name = self.name.clone();
        responder.respond_with_file(
            length,
            &name,
            Box::new(move |out| {
                if let Err(e) = stream_file(&path, length, out) {
                    error_log!("reading downloaded file {:?} failed: {}", path, e);
                }
            }),
        );
    }
}

fn stream_file(path: &std::path::Path, length: u64, out: &mut dyn Write) -> io::Result<()> {
    let mut file = File::open(path)?;
    let mut buf = [0u8; 1 << 16];
    let mut left = length;
    while left > 0 {
        let want = left.min(buf.len() as u64) as usize;
        file.read_exact(&mut buf[..want])?;
        out.write_all(&buf[..want])?;
        left -= want as u64;
    }
    Ok(())
}

impl Drop for FileDownload {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn sanitizes_ordinary_filenames_unchanged_in_shape() {
        assert_eq!(sanitize_filename("report.pdf"), "report.pdf");
    }

    #[test]
    fn replaces_missing_or_invalid_extension_with_bin() {
        assert_eq!(sanitize_filename("noext"), "noext.bin");
        assert_eq!(sanitize_filename("weird.toolongext"), "weird_toolongext.bin");
    }

    #[test]
    fn strips_unsafe_characters_from_base_and_collapses_runs() {
        // Leading punctuation is dropped rather than turned into underscores
        // (nothing has been pushed to `ret` yet to separate it from), matching
        // the source's `sanitizeBase`; the `/` between "etc" and "passwd" does
        // become a single separating underscore.
        assert_eq!(sanitize_filename("../../etc/passwd.txt"), "etc_passwd.txt");
    }

    #[test]
    fn forces_base_to_start_with_a_letter() {
        assert_eq!(sanitize_filename("123.txt"), "file_123.txt");
    }

    #[test]
    fn truncates_long_base_to_32_chars() {
        let long = "a".repeat(100);
        let sanitized = sanitize_filename(&format!("{}.txt", long));
        let base = sanitized.strip_suffix(".txt").unwrap();
        assert!(base.len() <= 32);
    }

    struct CapturingResponder {
        length: std::sync::Mutex<u64>,
        filename: std::sync::Mutex<String>,
        body: std::sync::Mutex<Vec<u8>>,
        errored: AtomicBool,
    }

    impl DownloadResponder for CapturingResponder {
        fn respond_with_file(
            &self,
            content_length: u64,
            content_disposition_filename: &str,
            write_body: Box<dyn FnOnce(&mut dyn Write) + Send>,
        ) {
            *self.length.lock().unwrap() = content_length;
            *self.filename.lock().unwrap() = content_disposition_filename.to_string();
            let mut body = self.body.lock().unwrap();
            write_body(&mut *body as &mut dyn Write);
        }

        fn respond_with_server_error(&self) {
            self.errored.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn serve_streams_file_contents_and_runs_cleanup_on_drop() {
        let dir = std::env::temp_dir().join(format!("retrojsvice-download-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("payload.bin");
        std::fs::write(&path, b"hello download").unwrap();

        let cleaned_up = Arc::new(AtomicBool::new(false));
        let cleaned_up2 = cleaned_up.clone();
        let path_for_cleanup = path.clone();
        let download = FileDownload::new("report.bin", path.clone(), move || {
            std::fs::remove_file(&path_for_cleanup).ok();
            cleaned_up2.store(true, Ordering::SeqCst);
        });

        let responder = CapturingResponder {
            length: std::sync::Mutex::new(0),
            filename: std::sync::Mutex::new(String::new()),
            body: std::sync::Mutex::new(Vec::new()),
            errored: AtomicBool::new(false),
        };
        download.serve(&responder);
        assert_eq!(*responder.length.lock().unwrap(), 14);
        assert_eq!(&*responder.body.lock().unwrap(), b"hello download");
        assert!(!responder.errored.load(Ordering::SeqCst));

        drop(download);
        assert!(cleaned_up.load(Ordering::SeqCst));
        std::fs::remove_dir_all(&dir).ok();
    }
}
