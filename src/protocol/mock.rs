//! In-memory stand-ins for a server, used by the unit tests.
use std::{
    io::{self, Cursor, Write},
    sync::{Arc, Mutex},
};

use super::transport::{BLOCK_HEADER_SIZE, BlockWriter, decode_header};
use crate::{Session, SessionConfig};

/// Frames `text` as a single server message.
pub fn frame(text: &str, block_size: usize) -> Vec<u8> {
    let mut writer = BlockWriter::new(Vec::new(), block_size);
    writer.write_framed(text).unwrap();
    writer.into_inner()
}

/// Splits a block stream back into message payloads.
pub fn read_messages(bytes: &[u8], block_size: usize) -> Vec<Vec<u8>> {
    let mut messages = Vec::new();
    let mut current = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let (len, last) = decode_header([bytes[pos], bytes[pos + 1]]);
        assert!(len <= block_size, "block of {len} bytes exceeds {block_size}");
        pos += BLOCK_HEADER_SIZE;
        current.extend_from_slice(&bytes[pos..pos + len]);
        pos += len;
        if last {
            messages.push(std::mem::take(&mut current));
        }
    }
    assert!(current.is_empty(), "trailing non-final blocks");
    messages
}

/// Length and final flag of every block in `bytes`.
pub fn blocks(bytes: &[u8]) -> Vec<(usize, bool)> {
    let mut blocks = Vec::new();
    let mut pos = 0;
    while pos < bytes.len() {
        let (len, last) = decode_header([bytes[pos], bytes[pos + 1]]);
        blocks.push((len, last));
        pos += BLOCK_HEADER_SIZE + len;
    }
    blocks
}

/// A sequence of server replies, one framed message per reply.
#[derive(Default)]
pub struct Script {
    bytes: Vec<u8>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues one reply; `lines` are joined with newlines.
    pub fn reply(mut self, lines: &[&str]) -> Self {
        let mut text = lines.join("\n");
        if !text.is_empty() {
            text.push('\n');
        }
        self.bytes.extend(frame(&text, 8190));
        self
    }

    pub fn reply_all(self, lines: &[String]) -> Self {
        let lines: Vec<&str> = lines.iter().map(String::as_str).collect();
        self.reply(&lines)
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Write sink whose contents stay observable after it is moved into a session.
#[derive(Clone, Default)]
pub struct Capture {
    inner: Arc<Mutex<Vec<u8>>>,
}

impl Capture {
    pub fn bytes(&self) -> Vec<u8> {
        self.inner.lock().unwrap().clone()
    }

    /// Decoded text of every message written so far.
    pub fn messages(&self) -> Vec<String> {
        read_messages(&self.bytes(), 8190)
            .into_iter()
            .map(|m| String::from_utf8(m).unwrap())
            .collect()
    }
}

impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A session that reads `script` and records what it writes.
pub fn session(script: Script, config: SessionConfig) -> (Session, Capture) {
    let capture = Capture::default();
    let session = Session::new(Cursor::new(script.into_bytes()), capture.clone(), config)
        .expect("mock session");
    (session, capture)
}
