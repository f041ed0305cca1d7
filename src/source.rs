//! Raw input handling: file type detection and (optionally gzipped) text
//! loading with byte-level progress.

use crate::error::{EngineError, EngineResult};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::PathBuf;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Nwk,
    Nexus,
    Nextstrain,
    Jsonl,
    MetaCsv,
    MetaTsv,
}

impl FileType {
    pub fn from_name(name: &str) -> EngineResult<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "nwk" | "newick" => Ok(Self::Nwk),
            "nexus" | "nex" => Ok(Self::Nexus),
            "nextstrain" | "json" => Ok(Self::Nextstrain),
            "jsonl" | "taxonium" => Ok(Self::Jsonl),
            "meta_csv" | "csv" => Ok(Self::MetaCsv),
            "meta_tsv" | "tsv" => Ok(Self::MetaTsv),
            other => Err(EngineError::unsupported(format!(
                "Unknown file type '{other}'"
            ))),
        }
    }

    /// Guess the type from a file name, ignoring a trailing `.gz`.
    pub fn detect(filename: &str) -> Option<Self> {
        let lower = filename.to_ascii_lowercase();
        let stem = lower.strip_suffix(".gz").unwrap_or(&lower);
        let ext = stem.rsplit_once('.').map(|(_, ext)| ext)?;
        match ext {
            "nwk" | "newick" | "tree" | "tre" | "treefile" => Some(Self::Nwk),
            "nex" | "nexus" | "nxs" => Some(Self::Nexus),
            "json" => Some(Self::Nextstrain),
            "jsonl" => Some(Self::Jsonl),
            "csv" => Some(Self::MetaCsv),
            "tsv" | "txt" => Some(Self::MetaTsv),
            _ => None,
        }
    }

    /// An explicit type wins over the file name.
    pub fn resolve(explicit: Option<&str>, filename: &str) -> EngineResult<Self> {
        match explicit {
            Some(name) if !name.trim().is_empty() => Self::from_name(name),
            _ => Self::detect(filename).ok_or_else(|| {
                EngineError::unsupported(format!(
                    "Cannot determine file type of '{filename}'"
                ))
            }),
        }
    }

    pub fn is_metadata(self) -> bool {
        matches!(self, Self::MetaCsv | Self::MetaTsv)
    }
}

#[derive(Debug, Clone)]
pub enum InputSource {
    Path(PathBuf),
    Bytes(Vec<u8>),
    Text(String),
}

struct ProgressReader<R, F> {
    inner: R,
    callback: F,
    bytes_done: u64,
}

impl<R, F> ProgressReader<R, F> {
    fn new(inner: R, callback: F) -> Self {
        Self {
            inner,
            callback,
            bytes_done: 0,
        }
    }
}

impl<R: Read, F: FnMut(u64)> Read for ProgressReader<R, F> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.bytes_done += n as u64;
        (self.callback)(self.bytes_done);
        Ok(n)
    }
}

fn is_gzip(filename: &str, head: &[u8]) -> bool {
    filename.to_ascii_lowercase().ends_with(".gz") || head.starts_with(&GZIP_MAGIC)
}

fn decode(filename: &str, reader: impl Read, gzip: bool) -> EngineResult<String> {
    let mut text = String::new();
    let result = if gzip {
        GzDecoder::new(reader).read_to_string(&mut text)
    } else {
        BufReader::new(reader).read_to_string(&mut text)
    };
    result.map_err(|e| EngineError::invalid(format!("Could not read '{filename}': {e}")))?;
    Ok(text)
}

impl InputSource {
    /// Read the whole source as UTF-8 text, inflating gzip when the name
    /// ends in `.gz` or the data starts with the gzip magic bytes.
    /// `on_progress` receives (bytes read, total bytes if known).
    pub fn read_text(
        &self,
        filename: &str,
        on_progress: &mut dyn FnMut(u64, Option<u64>),
    ) -> EngineResult<String> {
        match self {
            Self::Text(text) => {
                on_progress(text.len() as u64, Some(text.len() as u64));
                Ok(text.clone())
            }
            Self::Bytes(bytes) => {
                let total = Some(bytes.len() as u64);
                let reader = ProgressReader::new(bytes.as_slice(), |done| on_progress(done, total));
                decode(filename, reader, is_gzip(filename, bytes))
            }
            Self::Path(path) => {
                let mut file = File::open(path).map_err(|e| {
                    EngineError::new(
                        crate::error::ErrorCode::Io,
                        format!("Could not open '{}': {e}", path.display()),
                    )
                })?;
                let total = file.metadata().ok().map(|m| m.len());
                let mut head = [0u8; 2];
                let head_len = file.read(&mut head)?;
                let gzip = is_gzip(&path.to_string_lossy(), &head[..head_len]);
                let reader = Read::chain(&head[..head_len], file);
                let reader = ProgressReader::new(reader, |done| on_progress(done, total));
                decode(filename, reader, gzip)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{Compression, write::GzEncoder};
    use std::io::Write;
    use tempfile::tempdir;

    fn gzip_bytes(text: &str) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(text.as_bytes()).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_detect_ignores_gz_suffix() {
        assert_eq!(FileType::detect("tree.nwk.gz"), Some(FileType::Nwk));
        assert_eq!(FileType::detect("auspice.JSON"), Some(FileType::Nextstrain));
        assert_eq!(FileType::detect("meta.tsv.gz"), Some(FileType::MetaTsv));
        assert_eq!(FileType::detect("README"), None);
    }

    #[test]
    fn test_unknown_explicit_type_is_structured_error() {
        let err = FileType::resolve(Some("phylip"), "x.nwk").unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::UnsupportedFormat);
        assert_eq!(FileType::resolve(Some(""), "x.nwk").unwrap(), FileType::Nwk);
    }

    #[test]
    fn test_gzip_file_is_inflated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tree.nwk.gz");
        std::fs::write(&path, gzip_bytes("(A,B);")).unwrap();
        let mut last = 0;
        let text = InputSource::Path(path)
            .read_text("tree.nwk.gz", &mut |done, _| last = done)
            .unwrap();
        assert_eq!(text, "(A,B);");
        assert!(last > 0);
    }

    #[test]
    fn test_gzip_magic_detected_without_suffix() {
        let text = InputSource::Bytes(gzip_bytes("(C,D);"))
            .read_text("upload", &mut |_, _| {})
            .unwrap();
        assert_eq!(text, "(C,D);");
    }
}
