//! Block framing over a byte stream.
//!
//! Every protocol message travels as a sequence of blocks. A block is a two
//! byte little-endian header followed by at most `block_size` payload bytes.
//! The header holds `(payload_len << 1) | last`, where `last` marks the final
//! block of a message.
//!
//! ```text
//!  header (LE)        payload
//! +----------------+------------------------+
//! | len << 1 | last| len bytes of UTF-8     |
//! +----------------+------------------------+
//!      2 bytes          <= block_size
//! ```
//!
//! The reading side reassembles blocks into lines. The end of a message is
//! surfaced to callers as a synthetic prompt line following the message's
//! last line, so the session only ever has to look at lines.
use std::io::{self, BufReader, ErrorKind, Read, Write};

use log::trace;
use thiserror::Error;

use super::{
    line::{Line, LineKind},
    trace::DebugLog,
};

pub const BLOCK_HEADER_SIZE: usize = 2;
/// Largest payload length the 15 bit length field can express.
pub const MAX_BLOCK_SIZE: usize = (u16::MAX >> 1) as usize;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("server closed the connection")]
    Eof,
    #[error("incomplete block read from stream: expected {expected} bytes, got {read}")]
    ShortRead { expected: usize, read: usize },
    #[error("server sent a block larger than the block size: {len} > {max}")]
    Oversized { len: usize, max: usize },
    #[error("transport io error: {0}")]
    Io(#[from] io::Error),
}

pub fn encode_header(len: usize, last: bool) -> [u8; BLOCK_HEADER_SIZE] {
    (((len as u16) << 1) | last as u16).to_le_bytes()
}

/// Returns the payload length and the final-block flag.
pub fn decode_header(header: [u8; BLOCK_HEADER_SIZE]) -> (usize, bool) {
    let raw = u16::from_le_bytes(header);
    ((raw >> 1) as usize, raw & 1 == 1)
}

/// Number of blocks a payload of `len` bytes is split into. An empty message
/// still needs one (empty, final) block.
pub fn block_count(len: usize, block_size: usize) -> usize {
    len.div_ceil(block_size).max(1)
}

/// Sending half of a session.
pub struct BlockWriter<W: Write> {
    inner: W,
    block_size: usize,
    pending: Vec<u8>,
    debug: Option<DebugLog>,
}

impl<W: Write> BlockWriter<W> {
    pub fn new(inner: W, block_size: usize) -> Self {
        assert!(block_size > 0 && block_size <= MAX_BLOCK_SIZE);
        Self {
            inner,
            block_size,
            pending: Vec::new(),
            debug: None,
        }
    }

    pub fn with_debug(mut self, debug: Option<DebugLog>) -> Self {
        self.debug = debug;
        self
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Queues raw, unframed bytes. Nothing reaches the stream before [`flush`](Self::flush).
    pub fn write(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    pub fn flush(&mut self) -> io::Result<()> {
        if !self.pending.is_empty() {
            if let Some(debug) = &self.debug {
                debug.tx(&String::from_utf8_lossy(&self.pending));
            }
            self.inner.write_all(&self.pending)?;
            self.pending.clear();
        }
        self.inner.flush()
    }

    /// Frames `text` as one message and flushes it.
    pub fn write_framed(&mut self, text: &str) -> io::Result<()> {
        self.write_framed_with(text, |_, _| {})
    }

    /// Like [`write_framed`](Self::write_framed), calling `progress(written, total)`
    /// after every block.
    pub fn write_framed_with<F>(&mut self, text: &str, mut progress: F) -> io::Result<()>
    where
        F: FnMut(usize, usize),
    {
        let bytes = text.as_bytes();
        let total = block_count(bytes.len(), self.block_size);

        if !self.pending.is_empty() {
            self.inner.write_all(&self.pending)?;
            self.pending.clear();
        }

        if bytes.is_empty() {
            self.write_block(&[], true)?;
            progress(1, total);
        } else {
            for (i, payload) in bytes.chunks(self.block_size).enumerate() {
                self.write_block(payload, i + 1 == total)?;
                progress(i + 1, total);
            }
        }

        self.inner.flush()
    }

    fn write_block(&mut self, payload: &[u8], last: bool) -> io::Result<()> {
        self.inner.write_all(&encode_header(payload.len(), last))?;
        self.inner.write_all(payload)?;

        trace!("wrote {}block of {} bytes", if last { "final " } else { "" }, payload.len());
        if let Some(debug) = &self.debug {
            if last {
                debug.td(&format!("write final block: {} bytes", payload.len()));
            } else {
                debug.td(&format!("write block: {} bytes", payload.len()));
            }
            debug.tx(&String::from_utf8_lossy(payload));
        }
        Ok(())
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Receiving half of a session.
pub struct BlockReader<R: Read> {
    inner: BufReader<R>,
    block_size: usize,
    buf: Vec<u8>,
    /// `buf` ends with the payload of a final block.
    at_end: bool,
    prompt_pending: bool,
    last_kind: LineKind,
    debug: Option<DebugLog>,
}

impl<R: Read> BlockReader<R> {
    /// The stream is assumed to be positioned right after a prompt, which is
    /// where an authenticated connection hands it over.
    pub fn new(inner: R, block_size: usize) -> Self {
        Self {
            inner: BufReader::new(inner),
            block_size,
            buf: Vec::new(),
            at_end: false,
            prompt_pending: false,
            last_kind: LineKind::Prompt,
            debug: None,
        }
    }

    pub fn with_debug(mut self, debug: Option<DebugLog>) -> Self {
        self.debug = debug;
        self
    }

    /// Kind of the line most recently returned by [`read_line`](Self::read_line).
    pub fn last_kind(&self) -> LineKind {
        self.last_kind
    }

    /// Returns the next line without its trailing newline, blocking until the
    /// line is complete.
    pub fn read_line(&mut self) -> Result<Line, TransportError> {
        let line = self.next_line()?;
        self.last_kind = line.kind();
        Ok(line)
    }

    /// Reads until the current message ends, returning the payload of every
    /// error line seen on the way. Returns immediately when already at a prompt.
    pub fn wait_for_prompt(&mut self) -> Result<Vec<String>, TransportError> {
        let mut errors = Vec::new();
        while !self.last_kind.is_prompt() {
            let line = self.read_line()?;
            if line.kind() == LineKind::Error {
                errors.push(line.payload().to_string());
            }
        }
        Ok(errors)
    }

    fn next_line(&mut self) -> Result<Line, TransportError> {
        loop {
            if self.prompt_pending {
                self.prompt_pending = false;
                if let Some(debug) = &self.debug {
                    debug.rd("inserting prompt");
                }
                return Ok(Line::prompt());
            }

            if let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
                let mut raw: Vec<u8> = self.buf.drain(..=pos).collect();
                raw.pop();
                let line = Line::new(decode(raw));
                if self.at_end && self.buf.is_empty() {
                    self.at_end = false;
                    self.prompt_pending = !line.kind().is_prompt();
                }
                return Ok(line);
            }

            if self.at_end {
                self.at_end = false;
                if self.buf.is_empty() {
                    return Ok(Line::prompt());
                }
                let raw = std::mem::take(&mut self.buf);
                self.prompt_pending = true;
                return Ok(Line::new(decode(raw)));
            }

            self.read_block()?;
        }
    }

    fn read_block(&mut self) -> Result<(), TransportError> {
        let mut header = [0_u8; BLOCK_HEADER_SIZE];
        if !self.fill(&mut header)? {
            if let Some(debug) = &self.debug {
                debug.rd("server closed the connection (EOF)");
            }
            return Err(TransportError::Eof);
        }

        let (len, last) = decode_header(header);
        trace!("read {}block of {len} bytes", if last { "final " } else { "" });
        if let Some(debug) = &self.debug {
            if last {
                debug.rd(&format!("read final block: {len} bytes"));
            } else {
                debug.rd(&format!("read new block: {len} bytes"));
            }
        }

        if len > self.block_size {
            return Err(TransportError::Oversized {
                len,
                max: self.block_size,
            });
        }

        let start = self.buf.len();
        self.buf.resize(start + len, 0);
        let mut payload = std::mem::take(&mut self.buf);
        let res = self.fill(&mut payload[start..]);
        self.buf = payload;
        if !res? && len > 0 {
            return Err(TransportError::ShortRead {
                expected: len,
                read: 0,
            });
        }

        if let Some(debug) = &self.debug {
            debug.rx(&String::from_utf8_lossy(&self.buf[start..]));
        }
        self.at_end = last;
        Ok(())
    }

    /// Fills `out` completely. Returns `false` if the stream ended before any
    /// byte was read; ending halfway is an error.
    fn fill(&mut self, out: &mut [u8]) -> Result<bool, TransportError> {
        let mut read = 0;
        while read < out.len() {
            match self.inner.read(&mut out[read..]) {
                Ok(0) if read == 0 => return Ok(false),
                Ok(0) => {
                    return Err(TransportError::ShortRead {
                        expected: out.len(),
                        read,
                    });
                }
                Ok(n) => read += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }
}

fn decode(raw: Vec<u8>) -> String {
    String::from_utf8(raw).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned())
}
