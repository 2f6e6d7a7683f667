use crate::bencode::{self, Value};
use crate::scheduler::InfoHash;
use anyhow::Context;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::collections::HashSet;
use std::io::Write;
use std::net::SocketAddrV4;
use std::path::PathBuf;
use std::sync::Mutex;
use unicode_normalization::UnicodeNormalization;

// Turns a verified info dict into the crawler's outputs: a magnet line and,
// unless disabled, a reconstructed .torrent file.

const MAX_FILENAME_CHARS: usize = 180;
const MAX_LISTED_FILES: usize = 10;

// Percent-encode everything except RFC 3986 unreserved characters.
const MAGNET_DN: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(Debug, Default, PartialEq, Eq)]
pub struct TorrentSummary {
    pub name: String,
    pub total_size: u64,
    pub files: Vec<(String, u64)>,
}

pub struct Storage {
    magnet_path: Option<PathBuf>,
    torrent_dir: Option<PathBuf>,
    written: Mutex<HashSet<InfoHash>>,
}

impl Storage {
    pub fn new(magnet_path: Option<PathBuf>, torrent_dir: Option<PathBuf>) -> Self {
        Self {
            magnet_path,
            torrent_dir,
            written: Mutex::new(HashSet::new()),
        }
    }

    /// Record one verified (infohash, info dict). Duplicate hashes within a
    /// run only log; files and the magnet log are written once.
    pub fn store(&self, infohash: InfoHash, info: &[u8], peer: SocketAddrV4) -> anyhow::Result<()> {
        let hash_hex = hex::encode(infohash);
        let summary = summarize_info(info).unwrap_or_default();

        tracing::info!(
            hash = %hash_hex,
            name = %summary.name,
            size = summary.total_size,
            files = summary.files.len(),
            peer = %peer,
            "torrent"
        );
        for (path, length) in summary.files.iter().take(MAX_LISTED_FILES) {
            tracing::info!("   {path} {length}");
        }

        let first_sighting = self.written.lock().expect("written lock").insert(infohash);
        if !first_sighting {
            return Ok(());
        }

        if let Some(magnet_path) = &self.magnet_path {
            let line = magnet_line(&hash_hex, &summary.name);
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(magnet_path)
                .with_context(|| format!("open magnet log {}", magnet_path.display()))?;
            file.write_all(line.as_bytes()).context("append magnet line")?;
        }

        if let Some(dir) = &self.torrent_dir {
            std::fs::create_dir_all(dir).context("create torrent dir")?;
            let stem = safe_filename(&summary.name, &hash_hex);
            let path = dir.join(format!("{stem}.torrent"));
            std::fs::write(&path, torrent_bytes(info))
                .with_context(|| format!("write {}", path.display()))?;
        }

        Ok(())
    }

    #[cfg(test)]
    pub fn disabled_for_tests() -> Self {
        Self::new(None, None)
    }
}

fn magnet_line(hash_hex: &str, name: &str) -> String {
    if name.is_empty() {
        format!("magnet:?xt=urn:btih:{hash_hex}\n")
    } else {
        let dn = utf8_percent_encode(name, MAGNET_DN);
        format!("magnet:?xt=urn:btih:{hash_hex}&dn={dn}\n")
    }
}

/// A minimal .torrent around the *verbatim* info dict bytes; re-encoding the
/// parsed dict could shift bytes and silently change the infohash.
fn torrent_bytes(info: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(info.len() + 24);
    out.extend_from_slice(b"d8:announce0:4:info");
    out.extend_from_slice(info);
    out.push(b'e');
    out
}

/// Pull display name, total size and the file list out of an info dict.
pub fn summarize_info(info: &[u8]) -> Option<TorrentSummary> {
    let dict = bencode::decode(info).ok()?;
    dict.as_dict()?;

    let name = text_field(&dict, b"name.utf-8", b"name").unwrap_or_default();

    let mut total_size = 0u64;
    let mut files = Vec::new();
    match dict.get(b"files").and_then(Value::as_list) {
        Some(entries) => {
            for entry in entries {
                let length = entry
                    .get_int(b"length")
                    .and_then(|l| u64::try_from(l).ok())
                    .unwrap_or(0);
                total_size += length;
                let path = entry
                    .get(b"path.utf-8")
                    .or_else(|| entry.get(b"path"))
                    .and_then(Value::as_list)
                    .map(|parts| {
                        parts
                            .iter()
                            .filter_map(Value::as_bytes)
                            .map(|p| decode_text(p, &dict))
                            .collect::<Vec<_>>()
                            .join("/")
                    })
                    .unwrap_or_default();
                files.push((path, length));
            }
        }
        None => {
            total_size = dict
                .get_int(b"length")
                .and_then(|l| u64::try_from(l).ok())
                .unwrap_or(0);
        }
    }

    Some(TorrentSummary {
        name,
        total_size,
        files,
    })
}

fn text_field(dict: &Value, utf8_key: &[u8], plain_key: &[u8]) -> Option<String> {
    let raw = dict.get_bytes(utf8_key).or_else(|| dict.get_bytes(plain_key))?;
    Some(decode_text(raw, dict))
}

/// Clean UTF-8 passes through; otherwise the info dict's declared `encoding`
/// decides (older torrents carry GBK, Shift_JIS and friends); lossy UTF-8 is
/// the last resort.
fn decode_text(raw: &[u8], info: &Value) -> String {
    if let Ok(text) = std::str::from_utf8(raw) {
        return text.to_string();
    }
    if let Some(label) = info
        .get_bytes(b"encoding")
        .and_then(|e| std::str::from_utf8(e).ok())
    {
        if let Some(encoding) = encoding_rs::Encoding::for_label(label.trim().as_bytes()) {
            let (text, _, _) = encoding.decode(raw);
            return text.into_owned();
        }
    }
    String::from_utf8_lossy(raw).into_owned()
}

/// Filesystem-safe single path component: NFKC-normalized, with path
/// separators and control characters turned into underscores, trimmed and
/// length-clamped.
fn safe_filename(name: &str, fallback: &str) -> String {
    let cleaned: String = name
        .nfkc()
        .map(|c| match c {
            '/' | '\\' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim().trim_matches('.');
    let clamped: String = trimmed.chars().take(MAX_FILENAME_CHARS).collect();
    let out = clamped.trim_end();
    if out.is_empty() {
        fallback.to_string()
    } else {
        out.to_string()
    }
}
