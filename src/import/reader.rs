//! Record readers for newline-delimited JSON task files.
//!
//! Files ending in `.gz` or `.bz2` are decompressed on the fly; anything else
//! is read as-is. Blank lines and empty objects are skipped. The first decode
//! or IO failure ends the stream.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use bzip2::read::MultiBzDecoder;
use flate2::read::MultiGzDecoder;
use serde_json::Value;

use crate::error::ImportError;

/// Lazy, finite sequence of decoded records. Not restartable; re-open the
/// source to read it again.
pub type RecordStream = Box<dyn Iterator<Item = Result<Value, ImportError>> + Send>;

/// Decompressor selected by file suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Bzip2,
}

impl Compression {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("gz") => Compression::Gzip,
            Some("bz2") => Compression::Bzip2,
            _ => Compression::None,
        }
    }

    fn wrap(self, file: File) -> Box<dyn Read + Send> {
        match self {
            Compression::None => Box::new(file),
            Compression::Gzip => Box::new(MultiGzDecoder::new(file)),
            Compression::Bzip2 => Box::new(MultiBzDecoder::new(file)),
        }
    }
}

/// Open a task file and decode it lazily.
pub fn open_records(path: &Path) -> Result<RecordStream, ImportError> {
    let file = File::open(path).map_err(|source| ImportError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let reader = Compression::from_path(path).wrap(file);
    Ok(Box::new(NdjsonRecords::new(reader, path.to_path_buf())))
}

/// Decode records from any byte source.
pub fn records_from_reader<R: Read + Send + 'static>(
    reader: R,
    source_name: impl Into<PathBuf>,
) -> RecordStream {
    Box::new(NdjsonRecords::new(reader, source_name.into()))
}

/// Build a stream from already decoded values.
pub fn records_from_values(values: Vec<Value>) -> RecordStream {
    Box::new(values.into_iter().map(Ok))
}

struct NdjsonRecords<R> {
    lines: io::Lines<BufReader<R>>,
    source: PathBuf,
    line: usize,
    done: bool,
}

impl<R: Read> NdjsonRecords<R> {
    fn new(reader: R, source: PathBuf) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
            source,
            line: 0,
            done: false,
        }
    }

    fn source_name(&self) -> String {
        self.source.display().to_string()
    }
}

impl<R: Read> Iterator for NdjsonRecords<R> {
    type Item = Result<Value, ImportError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => {
                    self.done = true;
                    self.line += 1;
                    // Invalid UTF-8 surfaces as InvalidData from `lines()`.
                    if e.kind() == io::ErrorKind::InvalidData {
                        return Some(Err(ImportError::Decode {
                            source_name: self.source_name(),
                            line: self.line,
                            reason: e.to_string(),
                        }));
                    }
                    return Some(Err(ImportError::Io {
                        path: self.source.clone(),
                        source: e,
                    }));
                }
            };
            self.line += 1;

            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(&line) {
                Ok(Value::Object(map)) if map.is_empty() => continue,
                Ok(value) => return Some(Ok(value)),
                Err(e) => {
                    self.done = true;
                    return Some(Err(ImportError::Decode {
                        source_name: self.source_name(),
                        line: self.line,
                        reason: e.to_string(),
                    }));
                }
            }
        }
        None
    }
}
