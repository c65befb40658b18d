use crate::error::MonitorError;
use log::{debug, info, warn};
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Follows a single log file and hands out complete new lines
///
/// The tailer keeps a byte offset into the file. When the file shrinks
/// below that offset it is treated as truncated and read again from the
/// start. A trailing line without a newline is held back until it is
/// completed. Bytes that are not valid UTF-8 are replaced rather than
/// rejected, so a corrupt line never stalls the tailer.
#[derive(Debug)]
pub struct FileTailer {
    path: PathBuf,
    reader: Option<BufReader<File>>,
    offset: u64,
    start_at_end: bool,
    lookback_lines: usize,
    opened_once: bool,
    partial: Vec<u8>,
}

impl FileTailer {
    pub fn new(path: impl Into<PathBuf>, start_at_end: bool, lookback_lines: usize) -> Self {
        Self {
            path: path.into(),
            reader: None,
            offset: 0,
            start_at_end,
            lookback_lines,
            opened_once: false,
            partial: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open (or reopen) the file and position the read offset
    ///
    /// The first open honours `start_at_end`, returning up to
    /// `lookback_lines` trailing lines. A reopen resumes from the previous
    /// offset, or from the start when the file is now shorter. A held-back
    /// partial line is read again in full.
    pub fn open(&mut self) -> Result<Vec<String>, MonitorError> {
        self.reader = None;
        let resume = self.offset.saturating_sub(self.partial.len() as u64);
        self.partial.clear();
        let file = File::open(&self.path).map_err(|e| {
            MonitorError::SourceUnavailable(format!("{}: {}", self.path.display(), e))
        })?;
        let len = file.metadata()?.len();

        let mut replay = Vec::new();
        let position = if !self.opened_once {
            if self.start_at_end {
                if self.lookback_lines > 0 {
                    replay = self.read_tail_lines()?;
                }
                len
            } else {
                0
            }
        } else if len < resume {
            info!(
                "{} is shorter than the last read offset, reading from the start",
                self.path.display()
            );
            0
        } else {
            resume
        };

        let mut reader = BufReader::new(file);
        reader.seek(SeekFrom::Start(position))?;
        self.offset = position;
        self.reader = Some(reader);
        self.opened_once = true;
        debug!("Opened {} at offset {}", self.path.display(), position);
        Ok(replay)
    }

    /// Read every complete line appended since the last call
    pub fn read_lines(&mut self) -> Result<Vec<String>, MonitorError> {
        let current_len = match std::fs::metadata(&self.path) {
            Ok(meta) => meta.len(),
            Err(e) => {
                self.reader = None;
                return Err(MonitorError::SourceUnavailable(format!(
                    "{}: {}",
                    self.path.display(),
                    e
                )));
            }
        };
        if current_len < self.offset {
            info!("{} was truncated", self.path.display());
            self.offset = 0;
            self.partial.clear();
            if let Some(reader) = self.reader.as_mut() {
                reader.seek(SeekFrom::Start(0))?;
            }
        }

        let reader = self.reader.as_mut().ok_or_else(|| {
            MonitorError::SourceUnavailable(format!("{} is not open", self.path.display()))
        })?;

        let mut lines = Vec::new();
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let n = match reader.read_until(b'\n', &mut buf) {
                Ok(n) => n,
                Err(e) => {
                    // Reopening resumes from the last consumed offset
                    self.reader = None;
                    let err =
                        MonitorError::SourceUnavailable(format!("{}: {}", self.path.display(), e));
                    if lines.is_empty() {
                        return Err(err);
                    }
                    warn!("{}, keeping {} lines read before it", err, lines.len());
                    break;
                }
            };
            if n == 0 {
                break;
            }
            self.offset += n as u64;
            if buf.last() != Some(&b'\n') {
                self.partial.extend_from_slice(&buf);
                break;
            }
            let mut bytes = std::mem::take(&mut self.partial);
            bytes.extend_from_slice(&buf);
            let line = String::from_utf8_lossy(&bytes);
            let line = line.trim_end_matches(['\n', '\r']);
            if !line.trim().is_empty() {
                lines.push(line.to_string());
            }
        }
        Ok(lines)
    }

    fn read_tail_lines(&self) -> Result<Vec<String>, MonitorError> {
        let bytes = std::fs::read(&self.path)?;
        let content = String::from_utf8_lossy(&bytes);
        let lines: Vec<&str> = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .collect();
        let skip = lines.len().saturating_sub(self.lookback_lines);
        Ok(lines[skip..].iter().map(|l| l.to_string()).collect())
    }
}
