//! Tandem Session Recording
//!
//! A recording is a file that can be replayed by a client to reproduce a
//! session. It holds a JSON metadata header followed by every message that
//! entered the session history, in order.
//!
//! # Format
//!
//! ```text
//! magic        8 bytes   "TNDMREC\0"
//! header_len   u32 BE
//! header       header_len bytes of JSON
//! messages     length-delimited protobuf Envelopes until EOF
//! ```

#![deny(unsafe_code)]

use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use prost::Message;
use serde_json::Value;
use tandem_wire::Envelope;

/// File magic.
pub const MAGIC: &[u8; 8] = b"TNDMREC\0";

/// Conventional recording file extension.
pub const EXTENSION: &str = "tdrec";

// ============================================================================
// Writer
// ============================================================================

/// Streams a session recording to a file (or any writer).
pub struct RecordingWriter {
    out: BufWriter<Box<dyn Write + Send>>,
    path: Option<PathBuf>,
    header_written: bool,
    autoflush: bool,
    messages: u64,
}

impl RecordingWriter {
    /// Create a new recording file. Fails if the file already exists.
    pub fn create(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;

        let mut writer = Self::from_writer(Box::new(file));
        writer.path = Some(path.to_path_buf());
        Ok(writer)
    }

    pub fn from_writer(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: BufWriter::new(out),
            path: None,
            header_written: false,
            autoflush: false,
            messages: 0,
        }
    }

    /// Flush after every recorded message.
    pub fn set_autoflush(&mut self, autoflush: bool) {
        self.autoflush = autoflush;
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn message_count(&self) -> u64 {
        self.messages
    }

    /// Write the magic and metadata header. Must be called exactly once,
    /// before any message.
    pub fn write_header(&mut self, metadata: &Value) -> io::Result<()> {
        if self.header_written {
            return Err(io::Error::other("recording header already written"));
        }

        let json = serde_json::to_vec(metadata)?;
        let len = u32::try_from(json.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "header too large"))?;

        self.out.write_all(MAGIC)?;
        self.out.write_all(&len.to_be_bytes())?;
        self.out.write_all(&json)?;
        self.header_written = true;
        Ok(())
    }

    pub fn record_message(&mut self, msg: &Envelope) -> io::Result<()> {
        if !self.header_written {
            return Err(io::Error::other("recording header not written"));
        }

        self.out.write_all(&msg.encode_length_delimited_to_vec())?;
        self.messages += 1;
        if self.autoflush {
            self.out.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }

    pub fn close(mut self) -> io::Result<()> {
        self.out.flush()
    }
}

// ============================================================================
// Reader
// ============================================================================

/// A decoded recording.
#[derive(Debug, Clone, PartialEq)]
pub struct Recording {
    pub header: Value,
    pub messages: Vec<Envelope>,
}

/// Read a recording file.
pub fn read_recording(path: &Path) -> io::Result<Recording> {
    let data = fs::read(path)?;
    decode_recording(&data)
}

/// Decode an in-memory recording.
pub fn decode_recording(data: &[u8]) -> io::Result<Recording> {
    let invalid = |reason: String| io::Error::new(io::ErrorKind::InvalidData, reason);

    let rest = data
        .strip_prefix(MAGIC.as_slice())
        .ok_or_else(|| invalid("not a recording (bad magic)".to_string()))?;

    let (len_bytes, rest) = rest
        .split_first_chunk::<4>()
        .ok_or_else(|| invalid("truncated header length".to_string()))?;
    let header_len = u32::from_be_bytes(*len_bytes) as usize;
    if rest.len() < header_len {
        return Err(invalid("truncated header".to_string()));
    }

    let (header, mut body) = rest.split_at(header_len);
    let header: Value = serde_json::from_slice(header)?;

    let mut messages = Vec::new();
    while !body.is_empty() {
        let msg = Envelope::decode_length_delimited(&mut body)
            .map_err(|e| invalid(format!("failed to decode message {}: {e}", messages.len())))?;
        messages.push(msg);
    }

    Ok(Recording { header, messages })
}

// ============================================================================
// File Naming
// ============================================================================

/// Append the recording extension if missing and pick a name that doesn't
/// exist yet by inserting `-2`, `-3`... before the extension.
pub fn make_filename_unique(path: &Path) -> PathBuf {
    let path = if path.extension().is_some_and(|e| e == EXTENSION) {
        path.to_path_buf()
    } else {
        let mut name = path.as_os_str().to_owned();
        name.push(".");
        name.push(EXTENSION);
        PathBuf::from(name)
    };

    if !path.exists() {
        return path;
    }

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut n = 2u32;
    loop {
        let candidate = path.with_file_name(format!("{stem}-{n}.{EXTENSION}"));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_messages() -> Vec<Envelope> {
        vec![
            Envelope::user_join(1, 0, "alice", Vec::new()),
            Envelope::drawing(1, 130, vec![1, 2, 3]),
            Envelope::chat(1, 0, "hello"),
        ]
    }

    #[test]
    fn test_write_then_read_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.tdrec");

        let mut writer = RecordingWriter::create(&path).unwrap();
        writer
            .write_header(&json!({"server-recording": true, "version": "tandem:1"}))
            .unwrap();
        for msg in sample_messages() {
            writer.record_message(&msg).unwrap();
        }
        assert_eq!(writer.message_count(), 3);
        writer.close().unwrap();

        let recording = read_recording(&path).unwrap();
        assert_eq!(recording.header["server-recording"], true);
        assert_eq!(recording.messages, sample_messages());
    }

    #[test]
    fn test_create_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taken.tdrec");
        fs::write(&path, b"x").unwrap();

        assert!(RecordingWriter::create(&path).is_err());
    }

    #[test]
    fn test_message_before_header_rejected() {
        let mut writer = RecordingWriter::from_writer(Box::new(io::sink()));
        assert!(writer.record_message(&Envelope::chat(1, 0, "x")).is_err());

        writer.write_header(&json!({})).unwrap();
        assert!(writer.write_header(&json!({})).is_err());
    }

    #[test]
    fn test_bad_magic() {
        let err = decode_recording(b"NOTAREC\0\0\0\0\0").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_truncated_message() {
        let mut data = MAGIC.to_vec();
        data.extend(2u32.to_be_bytes());
        data.extend(b"{}");
        let mut msg = Envelope::chat(1, 0, "hello").encode_length_delimited_to_vec();
        msg.truncate(msg.len() - 2);
        data.extend(msg);

        assert!(decode_recording(&data).is_err());
    }

    #[test]
    fn test_unique_filename() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("rec");

        let first = make_filename_unique(&base);
        assert_eq!(first, dir.path().join("rec.tdrec"));
        fs::write(&first, b"").unwrap();

        let second = make_filename_unique(&base);
        assert_eq!(second, dir.path().join("rec-2.tdrec"));
        fs::write(&second, b"").unwrap();

        assert_eq!(
            make_filename_unique(&dir.path().join("rec.tdrec")),
            dir.path().join("rec-3.tdrec")
        );
    }
}
