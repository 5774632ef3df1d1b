use byteorder::{ByteOrder, LittleEndian};

use super::Decompressor;
use crate::error::{ForgeError, Result};

const SYMBOLS: usize = 512;
const TABLE_BYTES: usize = SYMBOLS / 2;
const MAX_CODE_BITS: u32 = 15;
const BLOCK_SIZE: usize = 0x10000;

/// Xpress with Huffman coding, the codec behind the `xpress4k`, `xpress8k` and
/// `xpress16k` WOF algorithms.
///
/// Every 64 KiB of output starts with a 256-byte table of 4-bit code lengths for
/// 512 symbols: 256 literals, then matches whose symbol packs the length in the low
/// nibble and the number of offset bits in the high one. Codes are read MSB first
/// from little-endian 16-bit words.
#[derive(Debug, Default, Clone, Copy)]
pub struct XpressHuffman;

struct BitReader<'a> {
    input: &'a [u8],
    pos: usize,
    bits: u32,
    extra: i32,
}

impl<'a> BitReader<'a> {
    fn new(input: &'a [u8], pos: usize) -> Self {
        let bits = (u32::from(word_at(input, pos)) << 16) | u32::from(word_at(input, pos + 2));
        Self {
            input,
            pos: pos + 4,
            bits,
            extra: 16,
        }
    }

    fn peek(&self, count: u32) -> u32 {
        self.bits.checked_shr(32 - count).unwrap_or(0)
    }

    fn consume(&mut self, count: u32) {
        self.bits = self.bits.checked_shl(count).unwrap_or(0);
        self.extra -= count as i32;
        if self.extra < 0 {
            self.bits |= u32::from(word_at(self.input, self.pos)) << (-self.extra) as u32;
            self.extra += 16;
            self.pos += 2;
        }
    }

    fn byte(&mut self) -> Result<u8> {
        let b = *self
            .input
            .get(self.pos)
            .ok_or_else(|| ForgeError::corrupt("xpress", "match length past the input"))?;
        self.pos += 1;
        Ok(b)
    }

    fn word(&mut self) -> Result<u16> {
        if self.pos + 2 > self.input.len() {
            return Err(ForgeError::corrupt("xpress", "match length past the input"));
        }
        let w = LittleEndian::read_u16(&self.input[self.pos..self.pos + 2]);
        self.pos += 2;
        Ok(w)
    }
}

// The encoder pads the bit stream, reads past it see zeros.
fn word_at(input: &[u8], pos: usize) -> u16 {
    match input.get(pos..pos + 2) {
        Some(w) => LittleEndian::read_u16(w),
        None => 0,
    }
}

/// Canonical decoding table indexed by the next 15 bits of input.
fn build_table(lengths: &[u8; SYMBOLS]) -> Result<Vec<u16>> {
    let mut table = vec![0u16; 1 << MAX_CODE_BITS];
    let mut filled = 0usize;
    for bit_length in 1..=MAX_CODE_BITS {
        for (symbol, _) in lengths.iter().enumerate().filter(|(_, l)| u32::from(**l) == bit_length) {
            let span = 1usize << (MAX_CODE_BITS - bit_length);
            let end = filled + span;
            if end > table.len() {
                return Err(ForgeError::corrupt("xpress", "oversubscribed huffman table"));
            }
            table[filled..end].fill(symbol as u16);
            filled = end;
        }
    }
    if filled != table.len() {
        return Err(ForgeError::corrupt("xpress", "incomplete huffman table"));
    }
    Ok(table)
}

impl Decompressor for XpressHuffman {
    fn name(&self) -> &'static str {
        "xpress-huffman"
    }

    fn decompress(&self, input: &[u8], output: &mut [u8]) -> Result<usize> {
        let mut src = 0usize;
        let mut dst = 0usize;

        while dst < output.len() {
            let header = input
                .get(src..src + TABLE_BYTES)
                .ok_or_else(|| ForgeError::corrupt("xpress", format!("truncated huffman table at {:#x}", src)))?;
            let mut lengths = [0u8; SYMBOLS];
            for (i, b) in header.iter().enumerate() {
                lengths[2 * i] = b & 0x0F;
                lengths[2 * i + 1] = b >> 4;
            }
            let table = build_table(&lengths)?;

            let mut reader = BitReader::new(input, src + TABLE_BYTES);
            let block_end = (dst + BLOCK_SIZE).min(output.len());
            while dst < block_end {
                let symbol = table[reader.peek(MAX_CODE_BITS) as usize] as usize;
                reader.consume(u32::from(lengths[symbol]));

                if symbol < 256 {
                    output[dst] = symbol as u8;
                    dst += 1;
                    continue;
                }

                let symbol = symbol - 256;
                let offset_bits = (symbol >> 4) as u32;
                let mut length = symbol & 0x0F;
                if length == 15 {
                    length = usize::from(reader.byte()?);
                    if length == 255 {
                        length = usize::from(reader.word()?);
                        if length < 15 {
                            return Err(ForgeError::corrupt("xpress", "invalid extended match length"));
                        }
                        length -= 15;
                    }
                    length += 15;
                }
                length += 3;

                let offset = (1usize << offset_bits) | reader.peek(offset_bits) as usize;
                reader.consume(offset_bits);
                if offset > dst {
                    return Err(ForgeError::corrupt(
                        "xpress",
                        format!("match offset {} before the start of output at {:#x}", offset, dst),
                    ));
                }
                // byte by byte, the source may overlap the destination
                let end = (dst + length).min(output.len());
                while dst < end {
                    output[dst] = output[dst - offset];
                    dst += 1;
                }
            }
            src = reader.pos;
        }
        Ok(dst)
    }
}
