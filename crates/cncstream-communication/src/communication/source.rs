//! Bulk command sources for streaming
//!
//! A source yields commands one at a time and knows how many rows it holds
//! in total, so the controller can report progress without reading ahead.

use cncstream_core::{Command, Result};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// A lazily consumed sequence of commands
pub trait CommandSource: Send {
    /// Next command, `Ok(None)` once exhausted.
    ///
    /// A read error ends the source; the rows it could not read stay in
    /// [`rows_remaining`](CommandSource::rows_remaining).
    fn next_command(&mut self) -> Result<Option<Command>>;

    /// Number of rows in the source
    fn total_rows(&self) -> usize;

    /// Number of rows not yet consumed
    fn rows_remaining(&self) -> usize;

    /// Human readable name for console output
    fn name(&self) -> String {
        "queued commands".to_string()
    }
}

/// Commands held in memory
pub struct LineSource {
    lines: VecDeque<String>,
    total: usize,
}

impl LineSource {
    pub fn new<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let lines: VecDeque<String> = lines.into_iter().map(Into::into).collect();
        let total = lines.len();
        Self { lines, total }
    }
}

impl CommandSource for LineSource {
    fn next_command(&mut self) -> Result<Option<Command>> {
        Ok(self.lines.pop_front().map(Command::new))
    }

    fn total_rows(&self) -> usize {
        self.total
    }

    fn rows_remaining(&self) -> usize {
        self.lines.len()
    }
}

/// Read one raw line, without its terminator. Bytes that are not UTF-8,
/// such as Latin-1 comments, are replaced rather than rejected.
fn read_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Option<String>> {
    buf.clear();
    if reader.read_until(b'\n', buf)? == 0 {
        return Ok(None);
    }
    while matches!(buf.last(), Some(b'\n' | b'\r')) {
        buf.pop();
    }
    Ok(Some(String::from_utf8_lossy(buf).into_owned()))
}

/// Commands read from a G-code file as they are needed
pub struct FileSource {
    path: PathBuf,
    reader: BufReader<File>,
    buf: Vec<u8>,
    total: usize,
    consumed: usize,
    failed: bool,
}

impl FileSource {
    /// Open a file, counting its rows up front
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut counter = BufReader::new(File::open(&path)?);
        let mut buf = Vec::new();
        let mut total = 0;
        while read_line(&mut counter, &mut buf)?.is_some() {
            total += 1;
        }
        tracing::debug!("Opened {} with {} rows", path.display(), total);
        Ok(Self {
            reader: BufReader::new(File::open(&path)?),
            path,
            buf,
            total,
            consumed: 0,
            failed: false,
        })
    }
}

impl CommandSource for FileSource {
    fn next_command(&mut self) -> Result<Option<Command>> {
        if self.failed {
            return Ok(None);
        }
        match read_line(&mut self.reader, &mut self.buf) {
            Ok(Some(line)) => {
                self.consumed += 1;
                Ok(Some(Command::new(line)))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                tracing::error!(
                    "Failed reading {} after {} rows: {}",
                    self.path.display(),
                    self.consumed,
                    e
                );
                self.failed = true;
                Err(e.into())
            }
        }
    }

    fn total_rows(&self) -> usize {
        self.total
    }

    fn rows_remaining(&self) -> usize {
        self.total.saturating_sub(self.consumed)
    }

    fn name(&self) -> String {
        self.path.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_line_source() {
        let mut src = LineSource::new(["G0 X1", "(comment)", "G0 X2"]);
        assert_eq!(src.total_rows(), 3);
        assert_eq!(src.next_command().unwrap().unwrap().text, "G0 X1");
        assert_eq!(src.rows_remaining(), 2);
        assert!(src.next_command().unwrap().unwrap().is_empty());
        assert_eq!(src.next_command().unwrap().unwrap().text, "G0 X2");
        assert!(src.next_command().unwrap().is_none());
    }

    #[test]
    fn test_file_source() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "G21\nG0 X1 ; rapid\n\nM2").unwrap();

        let mut src = FileSource::open(file.path()).unwrap();
        assert_eq!(src.total_rows(), 4);
        let first = src.next_command().unwrap().unwrap();
        assert_eq!(first.text, "G21");
        let second = src.next_command().unwrap().unwrap();
        assert_eq!(second.comment.as_deref(), Some("rapid"));
        assert_eq!(src.rows_remaining(), 2);
        assert!(src.next_command().unwrap().unwrap().is_empty());
        assert_eq!(src.next_command().unwrap().unwrap().text, "M2");
        assert!(src.next_command().unwrap().is_none());
        assert_eq!(src.rows_remaining(), 0);
    }

    #[test]
    fn test_file_source_tolerates_latin1() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"G0 X1\r\n(depth 10\xB0)\r\nG0 X2").unwrap();

        let mut src = FileSource::open(file.path()).unwrap();
        assert_eq!(src.total_rows(), 3);
        assert_eq!(src.next_command().unwrap().unwrap().text, "G0 X1");
        let comment = src.next_command().unwrap().unwrap();
        assert!(comment.is_empty());
        assert!(comment.raw.starts_with("(depth 10"));
        assert_eq!(src.next_command().unwrap().unwrap().text, "G0 X2");
        assert!(src.next_command().unwrap().is_none());
        assert_eq!(src.rows_remaining(), 0);
    }

    /// Reader that fails after handing out its first line
    struct FailingReader {
        data: &'static [u8],
        served: bool,
    }

    impl std::io::Read for FailingReader {
        fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
            if self.served {
                return Err(std::io::Error::other("device removed"));
            }
            self.served = true;
            let n = self.data.len().min(out.len());
            out[..n].copy_from_slice(&self.data[..n]);
            Ok(n)
        }
    }

    #[test]
    fn test_read_line_reports_io_errors() {
        let mut reader = std::io::BufReader::new(FailingReader {
            data: b"G0 X1\n",
            served: false,
        });
        let mut buf = Vec::new();
        assert_eq!(read_line(&mut reader, &mut buf).unwrap().as_deref(), Some("G0 X1"));
        assert!(read_line(&mut reader, &mut buf).is_err());
    }

    #[test]
    fn test_missing_file() {
        assert!(FileSource::open("/nonexistent/cncstream.nc").is_err());
    }
}
