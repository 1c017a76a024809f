use std::cmp;
use std::collections::BTreeMap;

use crate::range_set::RangeSet;

/// Helper to assemble unordered byte-stream frames into an ordered stream
///
/// Used both for CRYPTO frames, whose contents feed the handshake as soon as
/// a contiguous prefix is available, and for stream reassembly. Out-of-order
/// segments are held keyed by offset; the range set records everything
/// received so far, so retransmitted or overlapping segments store only the
/// bytes not already held.
#[derive(Debug)]
pub(crate) struct Assembler {
    /// Offset of the next byte to deliver to the reader
    offset: u64,
    /// Everything received so far, delivered bytes included
    received: RangeSet,
    /// Undelivered segments by start offset; entries never overlap
    chunks: BTreeMap<u64, Vec<u8>>,
}

impl Assembler {
    pub(crate) fn new() -> Self {
        Self {
            offset: 0,
            received: RangeSet::new(),
            chunks: BTreeMap::new(),
        }
    }

    /// Whether `read` would return zero bytes
    pub(crate) fn blocked(&self) -> bool {
        self.chunks
            .keys()
            .next()
            .map_or(true, |&start| start != self.offset)
    }

    pub(crate) fn read(&mut self, buf: &mut [u8]) -> usize {
        let mut read = 0;
        while read < buf.len() {
            match self.chunks.keys().next() {
                Some(&start) if start == self.offset => {}
                _ => break,
            }
            let mut chunk = self.chunks.remove(&self.offset).unwrap();
            let n = cmp::min(chunk.len(), buf.len() - read);
            buf[read..read + n].copy_from_slice(&chunk[..n]);
            read += n;
            self.offset += n as u64;
            if n < chunk.len() {
                chunk.drain(..n);
                self.chunks.insert(self.offset, chunk);
                break;
            }
        }
        read
    }

    /// Remove and return all leading contiguous bytes
    pub(crate) fn read_contiguous(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(&start) = self.chunks.keys().next() {
            if start != self.offset {
                break;
            }
            let chunk = self.chunks.remove(&start).unwrap();
            self.offset += chunk.len() as u64;
            if out.is_empty() {
                out = chunk;
            } else {
                out.extend_from_slice(&chunk);
            }
        }
        out
    }

    pub(crate) fn insert(&mut self, offset: u64, data: &[u8]) {
        let end = offset + data.len() as u64;
        // Walk the gaps in what we've received, storing the new bytes that
        // fall within each one
        let mut start = cmp::max(offset, self.offset);
        while start < end {
            if let Some(covered) = self.received.containing(start) {
                start = covered.end;
                continue;
            }
            let stop = self
                .received
                .first_after(start)
                .map_or(end, |range| cmp::min(range.start, end));
            self.chunks.insert(
                start,
                data[(start - offset) as usize..(stop - offset) as usize].to_vec(),
            );
            start = stop;
        }
        self.received.insert(cmp::max(offset, self.offset)..end);
    }

    /// Current position in the stream
    pub(crate) fn offset(&self) -> u64 {
        self.offset
    }

    /// Discard all buffered data
    pub(crate) fn clear(&mut self) {
        self.chunks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn next(x: &mut Assembler) -> Option<Box<[u8]>> {
        let buf = x.read_contiguous();
        if buf.is_empty() {
            None
        } else {
            Some(buf.into())
        }
    }

    #[test]
    fn assemble_ordered() {
        let mut x = Assembler::new();
        assert_matches!(next(&mut x), None);
        x.insert(0, b"123");
        assert_matches!(next(&mut x), Some(ref y) if &y[..] == b"123");
        x.insert(3, b"456");
        assert_matches!(next(&mut x), Some(ref y) if &y[..] == b"456");
        x.insert(6, b"789");
        x.insert(9, b"10");
        assert_matches!(next(&mut x), Some(ref y) if &y[..] == b"78910");
        assert_matches!(next(&mut x), None);
    }

    #[test]
    fn assemble_unordered() {
        let mut x = Assembler::new();
        x.insert(3, b"456");
        assert_matches!(next(&mut x), None);
        x.insert(0, b"123");
        assert_matches!(next(&mut x), Some(ref y) if &y[..] == b"123456");
        assert_matches!(next(&mut x), None);
    }

    #[test]
    fn assemble_duplicate() {
        let mut x = Assembler::new();
        x.insert(0, b"123");
        x.insert(0, b"123");
        assert_matches!(next(&mut x), Some(ref y) if &y[..] == b"123");
        assert_matches!(next(&mut x), None);
    }

    #[test]
    fn assemble_contained() {
        let mut x = Assembler::new();
        x.insert(0, b"12345");
        x.insert(1, b"234");
        assert_matches!(next(&mut x), Some(ref y) if &y[..] == b"12345");
        assert_matches!(next(&mut x), None);
    }

    #[test]
    fn assemble_contains() {
        let mut x = Assembler::new();
        x.insert(1, b"234");
        x.insert(0, b"12345");
        assert_matches!(next(&mut x), Some(ref y) if &y[..] == b"12345");
        assert_matches!(next(&mut x), None);
    }

    #[test]
    fn assemble_overlapping() {
        let mut x = Assembler::new();
        x.insert(0, b"123");
        x.insert(1, b"234");
        assert_matches!(next(&mut x), Some(ref y) if &y[..] == b"1234");
        assert_matches!(next(&mut x), None);
    }

    #[test]
    fn assemble_complex() {
        let mut x = Assembler::new();
        x.insert(0, b"1");
        x.insert(2, b"3");
        x.insert(4, b"5");
        x.insert(0, b"123456");
        assert_matches!(next(&mut x), Some(ref y) if &y[..] == b"123456");
        assert_matches!(next(&mut x), None);
    }

    #[test]
    fn assemble_old() {
        let mut x = Assembler::new();
        x.insert(0, b"1234");
        assert_matches!(next(&mut x), Some(ref y) if &y[..] == b"1234");
        x.insert(0, b"1234");
        assert_matches!(next(&mut x), None);
    }

    #[test]
    fn assemble_stale_tail_of_read_data() {
        let mut x = Assembler::new();
        x.insert(0, b"abcd");
        let mut buf = [0; 2];
        assert_eq!(x.read(&mut buf), 2);
        // A retransmission spanning the read boundary adds nothing new
        x.insert(1, b"bcd");
        let mut rest = [0; 8];
        assert_eq!(x.read(&mut rest), 2);
        assert_eq!(&rest[..2], b"cd");
    }

    #[test]
    fn offset_advances_with_reads() {
        let mut x = Assembler::new();
        x.insert(0, b"abcdef");
        let mut buf = [0; 4];
        assert_eq!(x.read(&mut buf), 4);
        assert_eq!(x.offset(), 4);
        assert_eq!(&buf, b"abcd");
    }
}
