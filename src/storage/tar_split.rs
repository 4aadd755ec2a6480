//! Rebuilds a layer's uncompressed tar stream from its tar-split metadata.
//!
//! containers-storage keeps every layer's tar headers and padding in
//! `overlay-layers/<layer-id>.tar-split.gz` and the file contents in the
//! layer's `diff/` directory.  The tar-split file is gzip-compressed NDJSON:
//!
//! - Type 1 (file): name (or base64 `name_raw`), size and the base64 big-endian
//!   CRC-64/GO-ISO of the content in `payload`
//! - Type 2 (segment): base64 raw tar bytes (headers, padding, end-of-archive)
//!
//! Splicing the two back together yields the original tar byte for byte.  File
//! content is checked against the recorded CRC as it streams.

use std::{
    ffi::OsString,
    io::{self, BufRead, BufReader, Read},
    os::unix::ffi::OsStringExt,
    path::PathBuf,
};

use base64::prelude::*;
use cap_std::fs::{Dir, File};
use crc::{Crc, CRC_64_GO_ISO};
use flate2::read::GzDecoder;
use serde::Deserialize;

use super::error::{Result, StorageError};

static CRC64_ISO: Crc<u64> = Crc::<u64>::new(&CRC_64_GO_ISO);

/// Raw tar-split entry from the NDJSON stream.
#[derive(Debug, Deserialize)]
struct TarSplitEntryRaw {
    #[serde(rename = "type")]
    type_id: u8,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    name_raw: Option<String>,
    #[serde(default)]
    size: Option<i64>,
    #[serde(default)]
    payload: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum TarSplitEntry {
    File {
        path: PathBuf,
        size: u64,
        crc64: Option<u64>,
    },
    Segment(Vec<u8>),
}

fn decode_b64(what: &str, value: &str) -> Result<Vec<u8>> {
    BASE64_STANDARD
        .decode(value)
        .map_err(|e| StorageError::TarSplit(format!("invalid base64 {what}: {e}")))
}

impl TarSplitEntry {
    fn from_raw(raw: TarSplitEntryRaw) -> Result<Self> {
        match raw.type_id {
            1 => {
                let name = match (raw.name_raw, raw.name) {
                    (Some(name_raw), _) => OsString::from_vec(decode_b64("name_raw", &name_raw)?),
                    (None, Some(name)) => OsString::from(name),
                    (None, None) => {
                        return Err(StorageError::TarSplit("file entry without a name".into()))
                    }
                };
                let size = u64::try_from(raw.size.unwrap_or(0)).map_err(|_| {
                    StorageError::TarSplit(format!("negative size for {name:?}"))
                })?;
                let crc64 = match raw.payload {
                    Some(payload) if size > 0 => {
                        let bytes: [u8; 8] = decode_b64("crc64", &payload)?
                            .try_into()
                            .map_err(|b: Vec<u8>| {
                                StorageError::TarSplit(format!("invalid CRC64 length: {} bytes", b.len()))
                            })?;
                        Some(u64::from_be_bytes(bytes))
                    }
                    _ => None,
                };
                Ok(TarSplitEntry::File {
                    path: normalize(PathBuf::from(name)),
                    size,
                    crc64,
                })
            }
            2 => match raw.payload {
                Some(payload) => Ok(TarSplitEntry::Segment(decode_b64("payload", &payload)?)),
                None => Ok(TarSplitEntry::Segment(Vec::new())),
            },
            other => Err(StorageError::TarSplit(format!(
                "invalid tar-split entry type: {other}"
            ))),
        }
    }
}

/// Tar names are relative to the layer root, usually with a leading `./`.
fn normalize(path: PathBuf) -> PathBuf {
    path.components()
        .filter(|c| matches!(c, std::path::Component::Normal(_)))
        .collect()
}

enum State {
    Idle,
    Segment {
        data: Vec<u8>,
        pos: usize,
    },
    File {
        file: File,
        path: PathBuf,
        remaining: u64,
        expected: Option<u64>,
        crc: crc::Digest<'static, u64>,
    },
    Done,
}

/// Streams the uncompressed tar of one layer.
pub struct TarSplitReader {
    entries: BufReader<GzDecoder<File>>,
    /// `diff/` of this layer, followed by those of its lower layers.
    diff_dirs: Vec<Dir>,
    state: State,
    line: String,
    entry_count: usize,
}

impl std::fmt::Debug for TarSplitReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TarSplitReader")
            .field("entry_count", &self.entry_count)
            .finish_non_exhaustive()
    }
}

impl TarSplitReader {
    /// Opens the tar-split stream of `layer_id` inside the storage root.
    pub fn open(root: &Dir, layer_id: &str) -> Result<Self> {
        let filename = format!("overlay-layers/{layer_id}.tar-split.gz");
        let file = root.open(&filename).map_err(|e| {
            StorageError::TarSplit(format!("failed to open tar-split file {filename}: {e}"))
        })?;

        let overlay = root.open_dir("overlay")?;
        let layer_dir = overlay
            .open_dir(layer_id)
            .map_err(|_| StorageError::LayerNotFound(layer_id.to_string()))?;
        let mut diff_dirs = vec![layer_dir.open_dir("diff")?];
        for link in read_lower(&layer_dir)? {
            let lower_id = resolve_link(&overlay, &link)?;
            diff_dirs.push(overlay.open_dir(format!("{lower_id}/diff"))?);
        }

        Ok(TarSplitReader {
            entries: BufReader::new(GzDecoder::new(file)),
            diff_dirs,
            state: State::Idle,
            line: String::new(),
            entry_count: 0,
        })
    }

    /// Number of file entries seen so far.
    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    fn open_in_chain(&self, path: &PathBuf) -> Result<File> {
        for dir in &self.diff_dirs {
            match dir.open(path) {
                Ok(file) => return Ok(file),
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StorageError::Io(e)),
            }
        }
        Err(StorageError::TarSplit(format!(
            "file not found in layer chain: {}",
            path.display()
        )))
    }

    fn next_entry(&mut self) -> Result<Option<TarSplitEntry>> {
        loop {
            self.line.clear();
            let n = self
                .entries
                .read_line(&mut self.line)
                .map_err(|e| StorageError::TarSplit(format!("failed to read tar-split line: {e}")))?;
            if n == 0 {
                return Ok(None);
            }
            if self.line.trim().is_empty() {
                continue;
            }
            let raw: TarSplitEntryRaw = serde_json::from_str(&self.line).map_err(|e| {
                StorageError::TarSplit(format!("failed to parse tar-split entry: {e}"))
            })?;
            return TarSplitEntry::from_raw(raw).map(Some);
        }
    }

    /// Moves to the next state that can produce bytes, or to `Done`.
    fn advance(&mut self) -> Result<()> {
        while matches!(self.state, State::Idle) {
            self.state = match self.next_entry()? {
                None => State::Done,
                Some(TarSplitEntry::Segment(data)) if data.is_empty() => State::Idle,
                Some(TarSplitEntry::Segment(data)) => State::Segment { data, pos: 0 },
                Some(TarSplitEntry::File { size: 0, .. }) => {
                    self.entry_count += 1;
                    State::Idle
                }
                Some(TarSplitEntry::File { path, size, crc64 }) => {
                    self.entry_count += 1;
                    State::File {
                        file: self.open_in_chain(&path)?,
                        path,
                        remaining: size,
                        expected: crc64,
                        crc: CRC64_ISO.digest(),
                    }
                }
            };
        }
        Ok(())
    }

    fn read_inner(&mut self, out: &mut [u8]) -> Result<usize> {
        loop {
            self.advance()?;
            match &mut self.state {
                // advance() never leaves the reader idle
                State::Idle => continue,
                State::Done => return Ok(0),
                State::Segment { data, pos } => {
                    let n = out.len().min(data.len() - *pos);
                    out[..n].copy_from_slice(&data[*pos..*pos + n]);
                    *pos += n;
                    if *pos == data.len() {
                        self.state = State::Idle;
                    }
                    return Ok(n);
                }
                State::File {
                    file,
                    path,
                    remaining,
                    crc,
                    ..
                } => {
                    let want = out.len().min(usize::try_from(*remaining).unwrap_or(usize::MAX));
                    let n = file.read(&mut out[..want])?;
                    if n == 0 {
                        return Err(StorageError::TarSplit(format!(
                            "{} is {} bytes shorter than recorded",
                            path.display(),
                            remaining
                        )));
                    }
                    crc.update(&out[..n]);
                    *remaining -= n as u64;
                    if *remaining == 0 {
                        if let State::File {
                            path, expected, crc, ..
                        } = std::mem::replace(&mut self.state, State::Idle)
                        {
                            let computed = crc.finalize();
                            if let Some(expected) = expected.filter(|e| *e != computed) {
                                return Err(StorageError::TarSplit(format!(
                                    "CRC64 mismatch for {}: expected {expected:016x}, got {computed:016x}",
                                    path.display()
                                )));
                            }
                        }
                    }
                    return Ok(n);
                }
            }
        }
    }
}

impl Read for TarSplitReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        self.read_inner(out).map_err(|e| match e {
            StorageError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        })
    }
}

/// Link IDs from a layer's `lower` file (`l/<link>:l/<link>:...`).
///
/// The list covers every ancestor, nearest first.  Base layers have no file.
fn read_lower(layer_dir: &Dir) -> Result<Vec<String>> {
    match layer_dir.read_to_string("lower") {
        Ok(content) => Ok(content
            .trim()
            .split(':')
            .filter_map(|s| s.strip_prefix("l/"))
            .map(|s| s.to_string())
            .collect()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(StorageError::Io(e)),
    }
}

/// Resolves `overlay/l/<link>` (a symlink to `../<layer-id>/diff`) to the layer ID.
fn resolve_link(overlay: &Dir, link: &str) -> Result<String> {
    let target = overlay
        .read_link(format!("l/{link}"))
        .map_err(|e| StorageError::LinkRead(format!("failed to read link {link}: {e}")))?;
    let target_str = target
        .to_str()
        .ok_or_else(|| StorageError::LinkRead("invalid UTF-8 in link target".to_string()))?;
    match target_str.split('/').collect::<Vec<_>>()[..] {
        [.., layer_id, "diff"] if !layer_id.is_empty() && layer_id != ".." => {
            Ok(layer_id.to_string())
        }
        _ => Err(StorageError::LinkRead(format!(
            "invalid link target format: {target_str}"
        ))),
    }
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_entry_deserialization() {
        let raw: TarSplitEntryRaw =
            serde_json::from_str(r#"{"type":2,"payload":"dXN0YXIAMDA=","position":0}"#).unwrap();
        assert_eq!(
            TarSplitEntry::from_raw(raw).unwrap(),
            TarSplitEntry::Segment(b"ustar\x0000".to_vec())
        );

        let raw: TarSplitEntryRaw = serde_json::from_str(
            r#"{"type":1,"name":"./etc/hosts","size":123,"payload":"AAAAAAAAAAE=","position":1}"#,
        )
        .unwrap();
        assert_eq!(
            TarSplitEntry::from_raw(raw).unwrap(),
            TarSplitEntry::File {
                path: PathBuf::from("etc/hosts"),
                size: 123,
                crc64: Some(1),
            }
        );

        // directories carry no size and a null payload
        let raw: TarSplitEntryRaw =
            serde_json::from_str(r#"{"type":1,"name":"etc/","payload":null,"position":2}"#).unwrap();
        assert_eq!(
            TarSplitEntry::from_raw(raw).unwrap(),
            TarSplitEntry::File {
                path: PathBuf::from("etc"),
                size: 0,
                crc64: None,
            }
        );

        // non-UTF-8 names come through name_raw
        let raw: TarSplitEntryRaw =
            serde_json::from_str(r#"{"type":1,"name_raw":"/w==","size":0,"position":3}"#).unwrap();
        let TarSplitEntry::File { path, .. } = TarSplitEntry::from_raw(raw).unwrap() else {
            panic!("expected a file entry");
        };
        assert_eq!(path.as_os_str().as_encoded_bytes(), b"\xff");

        let raw: TarSplitEntryRaw = serde_json::from_str(r#"{"type":99}"#).unwrap();
        assert!(TarSplitEntry::from_raw(raw).is_err());

        let raw: TarSplitEntryRaw =
            serde_json::from_str(r#"{"type":1,"name":"x","size":8,"payload":"AAAA"}"#).unwrap();
        assert!(TarSplitEntry::from_raw(raw).is_err());
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("./a/b".into()), PathBuf::from("a/b"));
        assert_eq!(normalize("/a/./b/".into()), PathBuf::from("a/b"));
        assert_eq!(normalize("../../etc/passwd".into()), PathBuf::from("etc/passwd"));
    }

    #[test]
    fn test_crc() {
        // CRC-64/GO-ISO check value
        assert_eq!(CRC64_ISO.checksum(b"123456789"), 0xb90956c775a41001);
    }
}
