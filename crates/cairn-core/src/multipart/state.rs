//! Rolling buffer that splits a multipart body at its boundaries

use bytes::{Buf, Bytes, BytesMut};

use crate::util::find_subslice;

const CRLF: &[u8] = b"\r\n";
const CLOSING_DASHES: &[u8] = b"--";
const HEADERS_END: &[u8] = b"\r\n\r\n";

/// Kind of boundary found in the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    /// `\r\n--boundary\r\n`: another part follows
    Delimiter,
    /// `\r\n--boundary--`: end of the body
    Terminal,
}

enum Detection {
    Found(usize, Boundary),
    /// A delimiter starts here but the bytes deciding its kind haven't arrived
    Undecided(usize),
    NotFound,
}

/// Buffer of not-yet-consumed body bytes.
///
/// Data is only released up to a point where no boundary can still begin:
/// the last `delimiter + 2` bytes stay buffered until more data arrives.
pub struct ParserState {
    buffer: BytesMut,
    delimiter: Vec<u8>,
    safe_margin: usize,
    complete: bool,
}

impl ParserState {
    pub fn new(boundary: &str) -> Self {
        let delimiter = format!("\r\n--{boundary}").into_bytes();
        let safe_margin = delimiter.len() + CRLF.len();
        let mut buffer = BytesMut::with_capacity(safe_margin * 2);
        // the first delimiter may come without a leading newline
        buffer.extend_from_slice(CRLF);
        Self {
            buffer,
            delimiter,
            safe_margin,
            complete: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    pub const fn safe_margin(&self) -> usize {
        self.safe_margin
    }

    pub fn has_enough_data(&self) -> bool {
        self.buffer.len() >= self.safe_margin
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the terminal boundary has been consumed
    pub const fn is_complete(&self) -> bool {
        self.complete
    }

    fn detect(&self) -> Detection {
        let mut from = 0;
        while let Some(pos) = find_subslice(&self.buffer, &self.delimiter, from) {
            let after = pos + self.delimiter.len();
            if self.buffer.len() < after + CRLF.len() {
                return Detection::Undecided(pos);
            }
            match &self.buffer[after..after + CRLF.len()] {
                CRLF => return Detection::Found(pos, Boundary::Delimiter),
                CLOSING_DASHES => return Detection::Found(pos, Boundary::Terminal),
                // boundary text inside part data
                _ => from = pos + 1,
            }
        }
        Detection::NotFound
    }

    /// Consume data up to the next boundary.
    ///
    /// Returns the boundary kind if one was found (and consumed) and the data
    /// preceding it that is safe to hand over.
    pub fn consume_till_boundary(&mut self) -> (Option<Boundary>, Bytes) {
        match self.detect() {
            Detection::Found(pos, boundary) => {
                let data = self.buffer.split_to(pos).freeze();
                self.buffer.advance(self.delimiter.len() + CRLF.len());
                if boundary == Boundary::Terminal {
                    self.complete = true;
                }
                (Some(boundary), data)
            }
            Detection::Undecided(pos) => (None, self.buffer.split_to(pos).freeze()),
            Detection::NotFound => {
                let safe = self.buffer.len().saturating_sub(self.safe_margin);
                (None, self.buffer.split_to(safe).freeze())
            }
        }
    }

    /// Consume a header block terminated by an empty line
    pub fn consume_headers(&mut self) -> Option<Bytes> {
        if self.buffer.starts_with(CRLF) {
            self.buffer.advance(CRLF.len());
            return Some(Bytes::new());
        }
        let pos = find_subslice(&self.buffer, HEADERS_END, 0)?;
        let headers = self.buffer.split_to(pos).freeze();
        self.buffer.advance(HEADERS_END.len());
        Some(headers)
    }

    /// Drop everything buffered (epilogue after the terminal boundary)
    pub fn discard(&mut self) {
        self.buffer.clear();
    }
}
