//! Incremental packet reader.
//!
//! Accepts bytes in arbitrary chunks, parses the head once it is complete,
//! accumulates content, and yields a whole [`Packet`]. Header and total size
//! caps are separate and cumulative; every size derived from the wire goes
//! through checked arithmetic. Errors surface synchronously on the feed that
//! caused them.

use bytes::{BufMut, BytesMut};
use tracing::trace;

use crate::common::num;
use crate::error::Error;

use super::header::{Head, Packet};
use super::VerificationLevel;

/// Default cap on the head portion alone.
pub(crate) const DEFAULT_HEADER_MAX: usize = 16 * 1024;

// Applied to chunk extensions and trailer fields of chunked bodies.
const CHUNK_LINE_LIMIT: usize = 16 * 1024;

pub(crate) struct PacketReader<H> {
    level: VerificationLevel,
    header_max: usize,
    total_max: usize,
    buf: BytesMut,
    head: Option<H>,
    head_len: usize,
    body: BytesMut,
    chunk: Option<ChunkDecoder>,
    total_seen: usize,
    continue_sent: bool,
    constructed: bool,
}

impl<H: Head> PacketReader<H> {
    pub(crate) fn new() -> PacketReader<H> {
        PacketReader {
            level: VerificationLevel::Weak,
            header_max: DEFAULT_HEADER_MAX,
            total_max: 0,
            buf: BytesMut::new(),
            head: None,
            head_len: 0,
            body: BytesMut::new(),
            chunk: None,
            total_seen: 0,
            continue_sent: false,
            constructed: false,
        }
    }

    pub(crate) fn set_verification_level(&mut self, level: VerificationLevel) {
        self.level = level;
    }

    /// Sets the cumulative packet size cap; zero means unlimited. Re-applied
    /// by owners before every feed so changes take immediate effect.
    pub(crate) fn set_max_size(&mut self, max: usize) {
        self.total_max = max;
    }

    pub(crate) fn set_header_max(&mut self, max: usize) {
        self.header_max = max;
    }

    /// True when the parsed head asks for a 100-continue interim response
    /// that has not been sent yet.
    pub(crate) fn expect_continue(&self) -> bool {
        !self.continue_sent
            && self
                .head
                .as_ref()
                .map_or(false, |h| h.header().expect_continue())
    }

    pub(crate) fn set_continue_sent(&mut self) {
        self.continue_sent = true;
    }

    pub(crate) fn feed(&mut self, chunk: &[u8]) -> crate::Result<Option<Packet<H>>> {
        self.read(chunk, false)
    }

    /// Feed that completes on the head alone, for tunnel setup responses.
    pub(crate) fn feed_header_only(&mut self, chunk: &[u8]) -> crate::Result<Option<Packet<H>>> {
        self.read(chunk, true)
    }

    fn read(&mut self, chunk: &[u8], hdr_only: bool) -> crate::Result<Option<Packet<H>>> {
        if self.constructed {
            self.clear();
        }

        self.check_sz(chunk.len())?;

        if self.head.is_none() {
            if chunk.is_empty() && self.buf.is_empty() {
                return Err(Error::new_http_parse().with("empty feed before any header bytes"));
            }
            self.buf.extend_from_slice(chunk);
            match H::parse(&self.buf, self.level)? {
                None => {
                    // no terminator yet; accumulated bytes alone may already
                    // exceed the header cap
                    if self.buf.len() > self.header_max {
                        return Err(Error::new_too_large(H::DIRECTION));
                    }
                    return Ok(None);
                }
                Some((head, n)) => {
                    if n > self.header_max {
                        return Err(Error::new_too_large(H::DIRECTION));
                    }
                    trace!(head_len = n, "parsed packet head");
                    self.head_len = n;
                    let trailing = self.buf.split_off(n);
                    self.buf.clear();
                    if head.header().chunked()? {
                        self.chunk = Some(ChunkDecoder::new());
                    }
                    self.head = Some(head);
                    // the declared length plus cached head bytes is checked
                    // against the cap on the same feed that parsed the head
                    self.check_declared()?;
                    self.append_body(&trailing)?;
                }
            }
        } else {
            self.append_body(chunk)?;
        }

        if hdr_only {
            self.constructed = true;
            let head = self.head.take().expect("head parsed above");
            return Ok(Some(Packet::assembled(head, Vec::new())));
        }

        if let Some(ref decoder) = self.chunk {
            if !decoder.is_done() {
                return Ok(None);
            }
            self.constructed = true;
            let mut head = self.head.take().expect("head parsed above");
            let body = std::mem::take(&mut self.body).to_vec();
            head.header_mut().set_content_length(body.len());
            return Ok(Some(Packet::assembled(head, body)));
        }

        let declared = match self.head.as_ref() {
            Some(head) => head.header().content_length()?,
            None => return Ok(None),
        };
        if (self.body.len() as u64) < declared {
            return Ok(None);
        }

        self.constructed = true;
        let head = self.head.take().expect("head parsed above");
        let mut body = std::mem::take(&mut self.body).to_vec();
        // excess bytes beyond the declared length are discarded; requests
        // pipelined into the same packet are not supported
        body.truncate(declared as usize);
        Ok(Some(Packet::assembled(head, body)))
    }

    fn append_body(&mut self, bytes: &[u8]) -> crate::Result<()> {
        match self.chunk {
            Some(ref mut decoder) => decoder.push(bytes, &mut self.body),
            None => {
                self.body.extend_from_slice(bytes);
                Ok(())
            }
        }
    }

    // Cumulative size accounting: total bytes seen is monotonic, and once
    // the head is known the declared length is re-checked on every feed.
    fn check_sz(&mut self, sz: usize) -> crate::Result<()> {
        if self.total_max == 0 {
            self.total_seen = self.total_seen.saturating_add(sz);
            return Ok(());
        }

        if self.head.is_some() {
            self.check_declared()?;
        }

        self.total_seen = num::add(self.total_seen, sz)
            .map_err(|_| Error::new_too_large(H::DIRECTION))?;
        if self.total_seen >= self.total_max {
            return Err(Error::new_too_large(H::DIRECTION));
        }
        Ok(())
    }

    fn check_declared(&self) -> crate::Result<()> {
        if self.total_max == 0 {
            return Ok(());
        }
        let head = match self.head.as_ref() {
            Some(h) => h,
            None => return Ok(()),
        };
        if !head.header().contains(super::header::names::CONTENT_LENGTH) {
            return Ok(());
        }
        let declared = head.header().content_length()?;
        if num::would_overflow_add(declared, self.head_len as u64) {
            return Err(Error::new_too_large(H::DIRECTION));
        }
        if declared + self.head_len as u64 >= self.total_max as u64 {
            return Err(Error::new_too_large(H::DIRECTION));
        }
        Ok(())
    }

    fn clear(&mut self) {
        self.buf.clear();
        self.body.clear();
        self.head = None;
        self.head_len = 0;
        self.chunk = None;
        self.total_seen = 0;
        self.constructed = false;
        // continue_sent survives: the interim response is single-shot per
        // reader even across keep-alive reuse
    }
}

#[derive(Debug, PartialEq, Clone, Copy)]
enum ChunkState {
    Size,
    Ext,
    SizeLf,
    Body,
    BodyCr,
    BodyLf,
    Trailer,
    Done,
}

// Incremental chunked-transfer decoder; the reader presents the decoded
// bytes as a single body.
struct ChunkDecoder {
    state: ChunkState,
    remaining: u64,
    digit_seen: bool,
    line_len: usize,
}

impl ChunkDecoder {
    fn new() -> ChunkDecoder {
        ChunkDecoder {
            state: ChunkState::Size,
            remaining: 0,
            digit_seen: false,
            line_len: 0,
        }
    }

    fn is_done(&self) -> bool {
        self.state == ChunkState::Done
    }

    fn push(&mut self, mut input: &[u8], out: &mut BytesMut) -> crate::Result<()> {
        use self::ChunkState::*;

        while !input.is_empty() {
            match self.state {
                Size => {
                    let b = input[0];
                    input = &input[1..];
                    match b {
                        b'0'..=b'9' | b'a'..=b'f' | b'A'..=b'F' => {
                            let digit = (b as char).to_digit(16).expect("hex digit") as u64;
                            self.remaining = self
                                .remaining
                                .checked_mul(16)
                                .and_then(|n| n.checked_add(digit))
                                .ok_or_else(|| {
                                    Error::new_http_parse().with("chunk size overflow")
                                })?;
                            self.digit_seen = true;
                        }
                        b';' if self.digit_seen => self.state = Ext,
                        b'\r' if self.digit_seen => self.state = SizeLf,
                        b'\n' if self.digit_seen => self.after_size(),
                        _ => {
                            return Err(Error::new_http_parse().with("invalid chunk size line"))
                        }
                    }
                }
                Ext => {
                    let b = input[0];
                    input = &input[1..];
                    match b {
                        b'\r' => self.state = SizeLf,
                        b'\n' => self.after_size(),
                        _ => {
                            self.line_len += 1;
                            if self.line_len > CHUNK_LINE_LIMIT {
                                return Err(Error::new_http_parse()
                                    .with("chunk extension over limit"));
                            }
                        }
                    }
                }
                SizeLf => {
                    let b = input[0];
                    input = &input[1..];
                    if b != b'\n' {
                        return Err(Error::new_http_parse().with("invalid chunk size line"));
                    }
                    self.after_size();
                }
                Body => {
                    let take = (self.remaining.min(input.len() as u64)) as usize;
                    out.put_slice(&input[..take]);
                    self.remaining -= take as u64;
                    input = &input[take..];
                    if self.remaining == 0 {
                        self.state = BodyCr;
                    }
                }
                BodyCr => {
                    let b = input[0];
                    input = &input[1..];
                    match b {
                        b'\r' => self.state = BodyLf,
                        b'\n' => self.reset_size(),
                        _ => return Err(Error::new_http_parse().with("invalid chunk body end")),
                    }
                }
                BodyLf => {
                    let b = input[0];
                    input = &input[1..];
                    if b != b'\n' {
                        return Err(Error::new_http_parse().with("invalid chunk body end"));
                    }
                    self.reset_size();
                }
                Trailer => {
                    let b = input[0];
                    input = &input[1..];
                    match b {
                        b'\n' => {
                            if self.line_len == 0 {
                                self.state = Done;
                            } else {
                                self.line_len = 0;
                            }
                        }
                        b'\r' => {}
                        _ => {
                            self.line_len += 1;
                            if self.line_len > CHUNK_LINE_LIMIT {
                                return Err(Error::new_http_parse()
                                    .with("chunk trailers over limit"));
                            }
                        }
                    }
                }
                Done => break,
            }
        }
        Ok(())
    }

    fn after_size(&mut self) {
        self.line_len = 0;
        if self.remaining == 0 {
            // final chunk: trailers (discarded) until the empty line
            self.state = ChunkState::Trailer;
        } else {
            self.state = ChunkState::Body;
        }
    }

    fn reset_size(&mut self) {
        self.state = ChunkState::Size;
        self.remaining = 0;
        self.digit_seen = false;
        self.line_len = 0;
    }
}
