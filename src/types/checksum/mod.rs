#![forbid(unsafe_code)]
//! Checksums used by the on-disk formats.
//!
//! Fixed-size records (log headers, the shared-memory header, page 1) carry a
//! CRC32 over their bytes. WAL frames carry a rolling two-word checksum that
//! chains each frame to the one before it, so a stale frame left over from an
//! earlier pass through the log never validates as a continuation.

/// Incremental checksum over byte slices.
pub trait Checksum {
    /// Clears accumulated state.
    fn reset(&mut self);
    /// Feeds more bytes.
    fn update(&mut self, bytes: &[u8]);
    /// Returns the checksum of everything fed since the last reset.
    fn finalize(&self) -> u32;
}

/// CRC32 backed by `crc32fast`.
pub struct Crc32Fast {
    inner: crc32fast::Hasher,
}

impl Default for Crc32Fast {
    fn default() -> Self {
        Self {
            inner: crc32fast::Hasher::new(),
        }
    }
}

impl Checksum for Crc32Fast {
    fn reset(&mut self) {
        self.inner.reset();
    }

    fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn finalize(&self) -> u32 {
        self.inner.clone().finalize()
    }
}

/// CRC32 of a record whose last four bytes hold the checksum itself.
pub fn record_crc32(record: &[u8]) -> u32 {
    let body = &record[..record.len() - 4];
    let mut c = Crc32Fast::default();
    c.update(body);
    c.finalize()
}

/// Writes the trailing CRC32 of `record` in place.
pub fn seal_record(record: &mut [u8]) {
    let crc = record_crc32(record);
    let len = record.len();
    record[len - 4..].copy_from_slice(&crc.to_be_bytes());
}

/// Returns true when the trailing CRC32 of `record` matches its body.
pub fn verify_record(record: &[u8]) -> bool {
    if record.len() < 4 {
        return false;
    }
    let len = record.len();
    let stored = u32::from_be_bytes([
        record[len - 4],
        record[len - 3],
        record[len - 2],
        record[len - 1],
    ]);
    stored == record_crc32(record)
}

/// Two-word rolling checksum carried from frame to frame.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct Rolling(pub [u32; 2]);

impl Rolling {
    /// Continues the chain over `data`. Input length must be a multiple of 8.
    pub fn extend(self, data: &[u8]) -> Rolling {
        debug_assert!(data.len() % 8 == 0, "rolling checksum input must be 8-byte aligned");
        let [mut s0, mut s1] = self.0;
        for pair in data.chunks_exact(8) {
            let a = u32::from_be_bytes([pair[0], pair[1], pair[2], pair[3]]);
            let b = u32::from_be_bytes([pair[4], pair[5], pair[6], pair[7]]);
            s0 = s0.wrapping_add(a).wrapping_add(s1);
            s1 = s1.wrapping_add(b).wrapping_add(s0);
        }
        Rolling([s0, s1])
    }

    /// Big-endian encoding.
    pub fn to_bytes(self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[..4].copy_from_slice(&self.0[0].to_be_bytes());
        out[4..].copy_from_slice(&self.0[1].to_be_bytes());
        out
    }

    /// Decodes the big-endian form written by [`Rolling::to_bytes`].
    pub fn from_bytes(src: &[u8]) -> Rolling {
        Rolling([
            u32::from_be_bytes([src[0], src[1], src[2], src[3]]),
            u32::from_be_bytes([src[4], src[5], src[6], src[7]]),
        ])
    }
}
