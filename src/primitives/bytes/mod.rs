#![forbid(unsafe_code)]
//! Encoding, varint, and buffer utilities shared across storage layers.
//!
//! Nothing outside this module and the checksum module touches raw byte
//! order; every on-disk structure is written through [`buf::Writer`] and read
//! back through [`buf::Reader`].

pub mod ord {
    //! Fixed-width big-endian helpers.

    /// Writes a big-endian u16 at `off`.
    pub fn put_u16(dst: &mut [u8], off: usize, v: u16) {
        dst[off..off + 2].copy_from_slice(&v.to_be_bytes());
    }

    /// Reads a big-endian u16 at `off`.
    pub fn get_u16(src: &[u8], off: usize) -> u16 {
        u16::from_be_bytes([src[off], src[off + 1]])
    }

    /// Writes a big-endian u32 at `off`.
    pub fn put_u32(dst: &mut [u8], off: usize, v: u32) {
        dst[off..off + 4].copy_from_slice(&v.to_be_bytes());
    }

    /// Reads a big-endian u32 at `off`.
    pub fn get_u32(src: &[u8], off: usize) -> u32 {
        u32::from_be_bytes([src[off], src[off + 1], src[off + 2], src[off + 3]])
    }

    /// Writes a big-endian u64 at `off`.
    pub fn put_u64(dst: &mut [u8], off: usize, v: u64) {
        dst[off..off + 8].copy_from_slice(&v.to_be_bytes());
    }

    /// Reads a big-endian u64 at `off`.
    pub fn get_u64(src: &[u8], off: usize) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&src[off..off + 8]);
        u64::from_be_bytes(b)
    }
}

pub mod var {
    //! Unsigned LEB128 varints.

    /// Largest encoded length of a u64.
    pub const MAX_LEN: usize = 10;

    /// Encodes a u64 as an unsigned varint.
    pub fn encode_u64(mut v: u64, out: &mut Vec<u8>) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                out.push(byte);
                break;
            }
            out.push(byte | 0x80);
        }
    }

    /// Number of bytes [`encode_u64`] produces for `v`.
    pub fn encoded_len(mut v: u64) -> usize {
        let mut n = 1;
        while v >= 0x80 {
            v >>= 7;
            n += 1;
        }
        n
    }

    /// Decodes a varint at `*off`, advancing it. `None` on truncation or overflow.
    pub fn decode_u64(src: &[u8], off: &mut usize) -> Option<u64> {
        let mut result = 0u64;
        let mut shift = 0u32;
        for _ in 0..MAX_LEN {
            let byte = *src.get(*off)?;
            *off += 1;
            let payload = u64::from(byte & 0x7f);
            if shift == 63 && payload > 1 {
                return None;
            }
            result |= payload << shift;
            if byte & 0x80 == 0 {
                return Some(result);
            }
            shift += 7;
        }
        None
    }
}

pub mod buf {
    //! Bounds-checked readers and writers for record encodings.

    use super::var;
    use crate::types::{BtError, Result};

    /// Appends fields to a growable buffer.
    #[derive(Default, Debug)]
    pub struct Writer {
        out: Vec<u8>,
    }

    impl Writer {
        /// Creates an empty writer.
        pub fn new() -> Self {
            Self::default()
        }

        /// Creates a writer with reserved capacity.
        pub fn with_capacity(cap: usize) -> Self {
            Self {
                out: Vec::with_capacity(cap),
            }
        }

        /// Appends one byte.
        pub fn u8(&mut self, v: u8) -> &mut Self {
            self.out.push(v);
            self
        }

        /// Appends a big-endian u16.
        pub fn u16(&mut self, v: u16) -> &mut Self {
            self.out.extend_from_slice(&v.to_be_bytes());
            self
        }

        /// Appends a big-endian u32.
        pub fn u32(&mut self, v: u32) -> &mut Self {
            self.out.extend_from_slice(&v.to_be_bytes());
            self
        }

        /// Appends a big-endian u64.
        pub fn u64(&mut self, v: u64) -> &mut Self {
            self.out.extend_from_slice(&v.to_be_bytes());
            self
        }

        /// Appends a varint.
        pub fn varint(&mut self, v: u64) -> &mut Self {
            var::encode_u64(v, &mut self.out);
            self
        }

        /// Appends raw bytes.
        pub fn bytes(&mut self, v: &[u8]) -> &mut Self {
            self.out.extend_from_slice(v);
            self
        }

        /// Appends a varint length followed by the bytes.
        pub fn blob(&mut self, v: &[u8]) -> &mut Self {
            self.varint(v.len() as u64);
            self.bytes(v)
        }

        /// Pads with zeroes up to `len` total bytes.
        pub fn pad_to(&mut self, len: usize) -> &mut Self {
            if self.out.len() < len {
                self.out.resize(len, 0);
            }
            self
        }

        /// Bytes written so far.
        pub fn len(&self) -> usize {
            self.out.len()
        }

        /// True when nothing has been written.
        pub fn is_empty(&self) -> bool {
            self.out.is_empty()
        }

        /// Consumes the writer.
        pub fn finish(self) -> Vec<u8> {
            self.out
        }
    }

    /// Reads fields from a slice, reporting truncation as corruption.
    pub struct Reader<'a> {
        buf: &'a [u8],
        off: usize,
        what: &'static str,
    }

    impl<'a> Reader<'a> {
        /// Creates a reader. `what` names the structure in corruption errors.
        pub fn new(buf: &'a [u8], what: &'static str) -> Self {
            Self { buf, off: 0, what }
        }

        /// Current offset.
        pub fn position(&self) -> usize {
            self.off
        }

        /// Bytes left.
        pub fn remaining(&self) -> usize {
            self.buf.len() - self.off
        }

        /// Takes the next `n` bytes.
        pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
            let end = self
                .off
                .checked_add(n)
                .filter(|end| *end <= self.buf.len())
                .ok_or(BtError::Corruption(self.what))?;
            let out = &self.buf[self.off..end];
            self.off = end;
            Ok(out)
        }

        /// Reads one byte.
        pub fn u8(&mut self) -> Result<u8> {
            Ok(self.take(1)?[0])
        }

        /// Reads a big-endian u16.
        pub fn u16(&mut self) -> Result<u16> {
            let b = self.take(2)?;
            Ok(u16::from_be_bytes([b[0], b[1]]))
        }

        /// Reads a big-endian u32.
        pub fn u32(&mut self) -> Result<u32> {
            let b = self.take(4)?;
            Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        }

        /// Reads a big-endian u64.
        pub fn u64(&mut self) -> Result<u64> {
            let b = self.take(8)?;
            let mut arr = [0u8; 8];
            arr.copy_from_slice(b);
            Ok(u64::from_be_bytes(arr))
        }

        /// Reads a varint.
        pub fn varint(&mut self) -> Result<u64> {
            var::decode_u64(self.buf, &mut self.off).ok_or(BtError::Corruption(self.what))
        }

        /// Reads a varint that must fit in `usize` and in the remaining input.
        pub fn len_prefix(&mut self) -> Result<usize> {
            let v = self.varint()?;
            let n = usize::try_from(v).map_err(|_| BtError::Corruption(self.what))?;
            if n > self.remaining() {
                return Err(BtError::Corruption(self.what));
            }
            Ok(n)
        }

        /// Reads a varint-length-prefixed blob.
        pub fn blob(&mut self) -> Result<&'a [u8]> {
            let n = self.len_prefix()?;
            self.take(n)
        }
    }
}

/// Length of the longest common prefix of `a` and `b`.
pub fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Shortest key `s` with `left < s <= right`, taken as a prefix of `right`.
///
/// Requires `left < right`.
pub fn separator(left: &[u8], right: &[u8]) -> Vec<u8> {
    debug_assert!(left < right, "separator needs strictly ordered keys");
    let n = common_prefix(left, right);
    right[..(n + 1).min(right.len())].to_vec()
}

#[cfg(test)]
mod tests {
    use super::buf::{Reader, Writer};
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn reader_reports_truncation() {
        let mut w = Writer::new();
        w.u32(7).blob(b"abc");
        let bytes = w.finish();
        let mut r = Reader::new(&bytes[..5], "test record");
        assert_eq!(r.u32().unwrap(), 7);
        assert!(matches!(
            r.blob(),
            Err(crate::types::BtError::Corruption("test record"))
        ));
    }

    #[test]
    fn separator_examples() {
        assert_eq!(separator(b"apple", b"banana"), b"b".to_vec());
        assert_eq!(separator(b"abc", b"abd"), b"abd".to_vec());
        assert_eq!(separator(b"ab", b"abc"), b"abc".to_vec());
        assert_eq!(separator(b"", b"a"), b"a".to_vec());
    }

    proptest! {
        #[test]
        fn varint_decodes_what_it_encodes(v in any::<u64>()) {
            let mut out = Vec::new();
            var::encode_u64(v, &mut out);
            prop_assert_eq!(out.len(), var::encoded_len(v));
            let mut off = 0;
            prop_assert_eq!(var::decode_u64(&out, &mut off), Some(v));
            prop_assert_eq!(off, out.len());
        }

        #[test]
        fn separator_splits_ordered_pairs(
            a in prop::collection::vec(any::<u8>(), 0..16),
            b in prop::collection::vec(any::<u8>(), 0..16),
        ) {
            prop_assume!(a != b);
            let (lo, hi) = if a < b { (a, b) } else { (b, a) };
            let sep = separator(&lo, &hi);
            prop_assert!(lo.as_slice() < sep.as_slice());
            prop_assert!(sep.as_slice() <= hi.as_slice());
        }
    }
}
