use byteorder::{ByteOrder, LittleEndian};

use super::Decompressor;
use crate::error::{ForgeError, Result};

const CHUNK_SIZE: usize = 0x1000;
const CHUNK_SIZE_MASK: u16 = 0x0FFF;
const CHUNK_IS_COMPRESSED: u16 = 0x8000;

/// The LZNT1 codec NTFS uses for compressed attributes.
///
/// Input is a sequence of chunks, each prefixed by a 16-bit header and each
/// expanding to 4096 bytes. A compressed chunk that encodes fewer bytes is
/// completed with zeros, which is how the format represents trailing zeros.
#[derive(Debug, Default, Clone, Copy)]
pub struct Lznt1;

impl Decompressor for Lznt1 {
    fn name(&self) -> &'static str {
        "lznt1"
    }

    fn decompress(&self, input: &[u8], output: &mut [u8]) -> Result<usize> {
        let mut src = 0usize;
        let mut dst = 0usize;

        while src + 2 <= input.len() && dst < output.len() {
            let header = LittleEndian::read_u16(&input[src..src + 2]);
            if header == 0 {
                break;
            }
            let chunk_end = src + (header & CHUNK_SIZE_MASK) as usize + 3;
            if chunk_end > input.len() {
                return Err(ForgeError::corrupt(
                    "lznt1",
                    format!("chunk at {:#x} ends past the compressed data", src),
                ));
            }
            src += 2;
            let chunk_start = dst;
            let chunk_limit = (dst + CHUNK_SIZE).min(output.len());

            if header & CHUNK_IS_COMPRESSED == 0 {
                if chunk_end - src != CHUNK_SIZE {
                    return Err(ForgeError::corrupt(
                        "lznt1",
                        format!("stored chunk of {} bytes", chunk_end - src),
                    ));
                }
                let take = chunk_limit - dst;
                output[dst..chunk_limit].copy_from_slice(&input[src..src + take]);
                dst = chunk_limit;
                src = chunk_end;
                continue;
            }

            while src < chunk_end {
                let tag = input[src];
                src += 1;
                for bit in 0..8 {
                    if src >= chunk_end {
                        break;
                    }
                    if tag & (1 << bit) == 0 {
                        if dst >= chunk_limit {
                            return Err(ForgeError::corrupt("lznt1", "literal past the end of the chunk"));
                        }
                        output[dst] = input[src];
                        dst += 1;
                        src += 1;
                        continue;
                    }

                    if src + 2 > chunk_end {
                        return Err(ForgeError::corrupt("lznt1", "truncated back reference"));
                    }
                    let token = LittleEndian::read_u16(&input[src..src + 2]);
                    src += 2;

                    let position = dst - chunk_start;
                    if position == 0 {
                        return Err(ForgeError::corrupt("lznt1", "back reference before any literal"));
                    }
                    // offset bits widen from 4 to 12 as the position passes 16, 32, ... 2048
                    let mut shift = 0u32;
                    let mut i = position - 1;
                    while i >= 0x10 {
                        shift += 1;
                        i >>= 1;
                    }
                    let back = (token >> (12 - shift)) as usize + 1;
                    let length = (token & (0x0FFF >> shift)) as usize + 3;

                    if back > position {
                        return Err(ForgeError::corrupt(
                            "lznt1",
                            format!("back reference {} before chunk start", back),
                        ));
                    }
                    if dst + length > chunk_limit {
                        return Err(ForgeError::corrupt("lznt1", "back reference past the end of the chunk"));
                    }
                    // overlapping copies repeat the pattern byte by byte
                    for _ in 0..length {
                        output[dst] = output[dst - back];
                        dst += 1;
                    }
                }
            }

            output[dst..chunk_limit].fill(0);
            dst = chunk_limit;
            src = chunk_end;
        }

        Ok(dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_chunk_is_completed_with_zeros() {
        let input = [0x03, 0xB0, 0x00, b'a', b'b', b'c'];
        let mut out = vec![0xFFu8; 4096];
        assert_eq!(Lznt1.decompress(&input, &mut out).unwrap(), 4096);
        assert_eq!(&out[..3], b"abc");
        assert!(out[3..].iter().all(|b| *b == 0));
    }

    #[test]
    fn back_reference_repeats_pattern() {
        // "abc" then (back 3, length 6)
        let input = [0x05, 0xB0, 0x08, b'a', b'b', b'c', 0x03, 0x20];
        let mut out = vec![0u8; 4096];
        Lznt1.decompress(&input, &mut out).unwrap();
        assert_eq!(&out[..9], b"abcabcabc");
        assert_eq!(out[9], 0);
    }

    #[test]
    fn stored_chunk_passes_through() {
        let mut input = vec![0xFF, 0x3F];
        input.extend((0..4096u32).map(|i| (i % 7) as u8));
        let mut out = vec![0u8; 8192];
        assert_eq!(Lznt1.decompress(&input, &mut out).unwrap(), 4096);
        assert_eq!(&out[..4096], &input[2..]);
    }

    #[test]
    fn leading_back_reference_is_corrupt() {
        let input = [0x02, 0xB0, 0x01, 0x00, 0x10];
        let mut out = vec![0u8; 4096];
        assert!(Lznt1.decompress(&input, &mut out).is_err());
    }

    #[test]
    fn chunk_longer_than_input_is_corrupt() {
        let input = [0x40, 0xB0, 0x00, b'a'];
        let mut out = vec![0u8; 4096];
        assert!(Lznt1.decompress(&input, &mut out).is_err());
    }
}
