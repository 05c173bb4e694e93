//! Chunked line reader: splits a byte stream on an arbitrary, possibly multi-byte separator.
//!
//! Chunks are produced lazily as the underlying reader is consumed, so a long-running
//! producer on stdin gets its lines relayed as soon as each separator arrives.

use std::io::{self, BufRead, BufReader, Read};

/// What to do with bytes that follow the last separator when the stream ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TrailingFragment {
    /// Yield the unterminated bytes as one final chunk.
    #[default]
    Emit,
    /// Discard them; only separator-terminated chunks are produced.
    Drop,
}

/// Iterator over separator-delimited chunks of a reader.
///
/// A chunk is the bytes strictly between two consecutive separators (or between the
/// start of the stream and the first separator). Empty chunks are yielded as-is; callers
/// decide whether to skip them.
pub struct Chunks<R> {
    reader: BufReader<R>,
    separator: Vec<u8>,
    trailing: TrailingFragment,
    pending: Vec<u8>,
    /// Prefix of `pending` already known not to contain the separator.
    scanned: usize,
    done: bool,
}

impl<R: Read> Chunks<R> {
    /// Fails with `InvalidInput` when `separator` is empty.
    pub fn new(
        reader: R,
        separator: impl Into<Vec<u8>>,
        trailing: TrailingFragment,
    ) -> io::Result<Self> {
        let separator = separator.into();
        if separator.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "separator must not be empty",
            ));
        }
        Ok(Self {
            reader: BufReader::new(reader),
            separator,
            trailing,
            pending: Vec::new(),
            scanned: 0,
            done: false,
        })
    }

    fn take_chunk(&mut self, at: usize) -> Vec<u8> {
        let chunk: Vec<u8> = self.pending.drain(..at).collect();
        self.pending.drain(..self.separator.len());
        self.scanned = 0;
        chunk
    }

    fn finish(&mut self) -> Option<io::Result<Vec<u8>>> {
        self.done = true;
        if self.pending.is_empty() {
            return None;
        }
        match self.trailing {
            TrailingFragment::Emit => Some(Ok(std::mem::take(&mut self.pending))),
            TrailingFragment::Drop => {
                log::debug!(
                    "dropping {} unterminated byte(s) at end of input",
                    self.pending.len()
                );
                self.pending.clear();
                None
            }
        }
    }
}

impl<R: Read> Iterator for Chunks<R> {
    type Item = io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            if let Some(pos) = find(&self.pending[self.scanned..], &self.separator) {
                let at = self.scanned + pos;
                return Some(Ok(self.take_chunk(at)));
            }
            // A separator may straddle the boundary with the next read.
            self.scanned = self
                .pending
                .len()
                .saturating_sub(self.separator.len() - 1);

            let buf = match self.reader.fill_buf() {
                Ok(buf) => buf,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            if buf.is_empty() {
                return self.finish();
            }
            let n = buf.len();
            self.pending.extend_from_slice(buf);
            self.reader.consume(n);
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
