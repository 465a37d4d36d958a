//! Connection output buffer
//!
//! Serialized frames accumulate here and are written to the transport
//! stream as a unit. In-memory segments are gathered into vectored writes;
//! file-backed segments go through the stream's `sendfile`.

use crate::hio::{HioStream, Result};
use bytes::{Buf, Bytes};
use std::collections::VecDeque;
use std::fs::File;
use std::io::IoSlice;
use std::sync::Arc;

/// Largest number of memory segments gathered into one `writev`
const MAX_IOVEC: usize = 16;

/// One piece of pending output
#[derive(Debug)]
pub enum Segment {
    Bytes(Bytes),
    File {
        file: Arc<File>,
        offset: u64,
        len: usize,
    },
}

impl Segment {
    fn len(&self) -> usize {
        match self {
            Segment::Bytes(b) => b.len(),
            Segment::File { len, .. } => *len,
        }
    }
}

/// Pending serialized output of one connection
#[derive(Debug, Default)]
pub struct OutputBuffer {
    segments: VecDeque<Segment>,
    len: usize,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes not yet handed to the transport
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn push_bytes(&mut self, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }
        self.len += bytes.len();
        self.segments.push_back(Segment::Bytes(bytes));
    }

    pub fn push_slice(&mut self, data: &[u8]) {
        self.push_bytes(Bytes::copy_from_slice(data));
    }

    /// Queue a zero-copy file segment
    pub fn push_file(&mut self, file: Arc<File>, offset: u64, len: usize) {
        if len == 0 {
            return;
        }
        self.len += len;
        self.segments.push_back(Segment::File { file, offset, len });
    }

    /// Drop everything queued
    pub fn clear(&mut self) {
        self.segments.clear();
        self.len = 0;
    }

    /// Write as much as the stream accepts
    ///
    /// Returns `Ok(true)` once the buffer is empty, `Ok(false)` when the
    /// stream would block.
    pub fn flush(&mut self, stream: &mut dyn HioStream) -> Result<bool> {
        while let Some(front) = self.segments.front() {
            let written = match front {
                Segment::Bytes(_) => {
                    let slices: Vec<IoSlice<'_>> = self
                        .segments
                        .iter()
                        .take(MAX_IOVEC)
                        .map_while(|s| match s {
                            Segment::Bytes(b) => Some(IoSlice::new(b)),
                            Segment::File { .. } => None,
                        })
                        .collect();
                    stream.writev(&slices)?
                }
                Segment::File { file, offset, len } => {
                    let file = file.clone();
                    let (offset, len) = (*offset, *len);
                    stream.sendfile(&file, offset, len)?
                }
            };
            if written == 0 {
                return Ok(false);
            }
            self.consume(written);
        }
        Ok(true)
    }

    fn consume(&mut self, mut n: usize) {
        self.len -= n.min(self.len);
        while n > 0 {
            let Some(front) = self.segments.front_mut() else {
                break;
            };
            let seg_len = front.len();
            if n >= seg_len {
                n -= seg_len;
                self.segments.pop_front();
                continue;
            }
            match front {
                Segment::Bytes(b) => b.advance(n),
                Segment::File { offset, len, .. } => {
                    *offset += n as u64;
                    *len -= n;
                }
            }
            n = 0;
        }
    }
}
