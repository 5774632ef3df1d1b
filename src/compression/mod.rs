//! Compressed attribute streams.
//!
//! A compressed stream is cut into compression units of `2^n` clusters. Each unit
//! is decoded on its own, and the run list alone tells how: a unit with all of its
//! clusters allocated is stored as-is, one with none allocated is sparse, and
//! anything in between holds codec output.
//!
//! WOF compressed files are laid out differently, see [`wof`].

pub mod lznt1;
pub mod wof;
pub mod xpress;

use crate::error::{ForgeError, Result};
use crate::mft::runlist::DataRun;

pub use lznt1::Lznt1;
pub use wof::{decode_wof_stream, WofAlgorithm, WofChunks};
pub use xpress::XpressHuffman;

/// Unit sizes NTFS produces: 16 clusters of 512 bytes up to 16 clusters of 4 KiB.
pub const VALID_UNIT_SIZES: [usize; 4] = [0x2000, 0x4000, 0x8000, 0x10000];

/// Codec contract for one compression unit.
pub trait Decompressor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Decodes `input` into `output` and returns the number of bytes written. It never
    /// writes past `output`; running out of room ends decoding.
    fn decompress(&self, input: &[u8], output: &mut [u8]) -> Result<usize>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    Compressed,
    Stored,
    Sparse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionUnit {
    pub vcn: u64,
    pub clusters: u64,
    pub backing_clusters: u64,
    pub kind: UnitKind,
}

/// Splits a run list into compression units of `unit_clusters` clusters, lazily so a
/// caller can stop at the end of the stream without walking a long sparse tail.
pub fn classify_units(runs: &[DataRun], unit_clusters: u64) -> impl Iterator<Item = CompressionUnit> + '_ {
    let (start, end) = match (runs.first(), runs.last()) {
        (Some(first), Some(last)) if unit_clusters != 0 => {
            (first.vcn_start - first.vcn_start % unit_clusters, last.vcn_end())
        }
        _ => (0, 0),
    };
    let mut next = Some(start);
    std::iter::from_fn(move || {
        let vcn = next.filter(|vcn| *vcn < end)?;
        next = vcn.checked_add(unit_clusters);
        let unit_end = next.unwrap_or(u64::MAX);
        let backing_clusters: u64 = runs
            .iter()
            .filter(|r| !r.is_sparse())
            .map(|r| {
                let lo = r.vcn_start.max(vcn);
                let hi = r.vcn_end().min(unit_end);
                hi.saturating_sub(lo)
            })
            .sum();
        let kind = if backing_clusters == 0 {
            UnitKind::Sparse
        } else if backing_clusters >= unit_clusters {
            UnitKind::Stored
        } else {
            UnitKind::Compressed
        };
        Some(CompressionUnit {
            vcn,
            clusters: unit_clusters,
            backing_clusters,
            kind,
        })
    })
}

/// Applies the stored/sparse/compressed rules and checks the decoded size.
pub struct UnitDecoder<D> {
    decompressor: D,
    unit_size: usize,
}

impl<D: Decompressor> UnitDecoder<D> {
    pub fn new(decompressor: D, unit_size: usize) -> Result<Self> {
        if !VALID_UNIT_SIZES.contains(&unit_size) {
            return Err(ForgeError::corrupt(
                "compression unit",
                format!("unsupported unit size {:#x}", unit_size),
            ));
        }
        Ok(Self {
            decompressor,
            unit_size,
        })
    }

    pub fn unit_size(&self) -> usize {
        self.unit_size
    }

    /// Decodes one unit into `output`, whose length is the exact size the unit
    /// must produce: the unit size, or less for the last unit of a stream.
    pub fn decode(&self, unit: &CompressionUnit, input: &[u8], output: &mut [u8]) -> Result<usize> {
        let expected = output.len();
        if expected > self.unit_size {
            return Err(ForgeError::UnitSizeMismatch {
                vcn: unit.vcn,
                expected: self.unit_size,
                actual: expected,
            });
        }

        match unit.kind {
            UnitKind::Sparse => {
                output.fill(0);
                Ok(expected)
            }
            UnitKind::Stored => {
                if input.len() < expected {
                    return Err(ForgeError::UnitSizeMismatch {
                        vcn: unit.vcn,
                        expected,
                        actual: input.len(),
                    });
                }
                output.copy_from_slice(&input[..expected]);
                Ok(expected)
            }
            UnitKind::Compressed => {
                let written = self.decompressor.decompress(input, output)?;
                if written != expected {
                    return Err(ForgeError::UnitSizeMismatch {
                        vcn: unit.vcn,
                        expected,
                        actual: written,
                    });
                }
                Ok(written)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(vcn_start: u64, length: u64, lcn: Option<u64>) -> DataRun {
        DataRun {
            vcn_start,
            length,
            lcn,
        }
    }

    #[test]
    fn classifies_units_from_runs() {
        // unit 0 fully allocated, unit 1 compressed to 3 clusters, unit 2 sparse
        let runs = [
            run(0, 16, Some(100)),
            run(16, 3, Some(200)),
            run(19, 13, None),
            run(32, 16, None),
        ];
        let units: Vec<CompressionUnit> = classify_units(&runs, 16).collect();
        let kinds: Vec<UnitKind> = units.iter().map(|u| u.kind).collect();
        assert_eq!(kinds, vec![UnitKind::Stored, UnitKind::Compressed, UnitKind::Sparse]);
        assert_eq!(units[1].backing_clusters, 3);
        assert_eq!(units[2].vcn, 32);
    }

    #[test]
    fn units_are_produced_on_demand() {
        let runs = [run(0, 16, Some(20)), run(16, 1 << 40, None)];
        let mut units = classify_units(&runs, 16);
        assert_eq!(units.next().map(|u| u.kind), Some(UnitKind::Stored));
        let second = units.next().unwrap();
        assert_eq!((second.vcn, second.kind), (16, UnitKind::Sparse));

        // a stream of 4 KiB stops after its first unit
        let needed = classify_units(&runs, 16).take_while(|u| u.vcn * 4096 < 4096).count();
        assert_eq!(needed, 1);
        assert_eq!(classify_units(&runs, 0).count(), 0);
        assert_eq!(classify_units(&[], 16).count(), 0);
    }

    #[test]
    fn stored_unit_is_identity() {
        let decoder = UnitDecoder::new(Lznt1, 0x2000).unwrap();
        let unit = CompressionUnit {
            vcn: 0,
            clusters: 16,
            backing_clusters: 16,
            kind: UnitKind::Stored,
        };
        let payload: Vec<u8> = (0..0x2000u32).map(|i| (i * 31 % 256) as u8).collect();
        let mut out = vec![0u8; 0x2000];
        assert_eq!(decoder.decode(&unit, &payload, &mut out).unwrap(), 0x2000);
        assert_eq!(out, payload);
    }

    #[test]
    fn sparse_unit_is_zeros_without_input() {
        let decoder = UnitDecoder::new(Lznt1, 0x10000).unwrap();
        let unit = CompressionUnit {
            vcn: 16,
            clusters: 16,
            backing_clusters: 0,
            kind: UnitKind::Sparse,
        };
        let mut out = vec![0xAAu8; 0x10000];
        assert_eq!(decoder.decode(&unit, &[], &mut out).unwrap(), 0x10000);
        assert!(out.iter().all(|b| *b == 0));
    }

    #[test]
    fn short_decoded_unit_is_corruption() {
        let decoder = UnitDecoder::new(Lznt1, 0x2000).unwrap();
        let unit = CompressionUnit {
            vcn: 0,
            clusters: 16,
            backing_clusters: 1,
            kind: UnitKind::Compressed,
        };
        // a single chunk decodes to 4096 bytes, the unit needs 8192
        let input = [0x03, 0xB0, 0x00, b'a', b'b', b'c', 0x00, 0x00];
        let mut out = vec![0u8; 0x2000];
        let err = decoder.decode(&unit, &input, &mut out).unwrap_err();
        assert!(matches!(
            err,
            ForgeError::UnitSizeMismatch {
                expected: 0x2000,
                actual: 0x1000,
                ..
            }
        ));
    }

    #[test]
    fn short_stored_payload_is_corruption() {
        let decoder = UnitDecoder::new(Lznt1, 0x2000).unwrap();
        let unit = CompressionUnit {
            vcn: 0,
            clusters: 16,
            backing_clusters: 16,
            kind: UnitKind::Stored,
        };
        let mut out = vec![0u8; 0x2000];
        assert!(decoder.decode(&unit, &[0u8; 0x1000], &mut out).is_err());
    }

    #[test]
    fn rejects_odd_unit_sizes() {
        assert!(UnitDecoder::new(Lznt1, 0x3000).is_err());
    }
}
