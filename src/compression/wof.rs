//! Windows Overlay Filter (WOF) compressed files.
//!
//! A file compressed by `compact /exe` keeps an empty, sparse unnamed `$DATA` of the
//! logical size, a `$REPARSE_POINT` tagged `IO_REPARSE_TAG_WOF` naming the algorithm,
//! and the actual bytes in the `WofCompressedData` stream: a table of chunk offsets
//! followed by chunks, each compressed on its own.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};

use super::{Decompressor, XpressHuffman};
use crate::error::{ForgeError, Result};

pub const IO_REPARSE_TAG_WOF: u32 = 0x8000_0017;
pub const WOF_STREAM_NAME: &str = "WofCompressedData";

const WOF_PROVIDER_FILE: u32 = 2;
const MAX_CHUNK_SIZE: u64 = 0x10_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WofAlgorithm {
    Xpress4k,
    Lzx,
    Xpress8k,
    Xpress16k,
}

impl WofAlgorithm {
    /// Values of `FILE_PROVIDER_EXTERNAL_INFO_V1::Algorithm`.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(WofAlgorithm::Xpress4k),
            1 => Some(WofAlgorithm::Lzx),
            2 => Some(WofAlgorithm::Xpress8k),
            3 => Some(WofAlgorithm::Xpress16k),
            _ => None,
        }
    }

    pub fn chunk_size(self) -> u64 {
        match self {
            WofAlgorithm::Xpress4k => 1 << 12,
            WofAlgorithm::Xpress8k => 1 << 13,
            WofAlgorithm::Xpress16k => 1 << 14,
            WofAlgorithm::Lzx => 1 << 15,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WofAlgorithm::Xpress4k => "xpress4k",
            WofAlgorithm::Lzx => "lzx",
            WofAlgorithm::Xpress8k => "xpress8k",
            WofAlgorithm::Xpress16k => "xpress16k",
        }
    }
}

impl fmt::Display for WofAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reads the algorithm out of a `$REPARSE_POINT` value. `Ok(None)` when the tag is
/// not WOF or the provider is not the file provider.
pub fn parse_wof_reparse(value: &[u8]) -> Result<Option<WofAlgorithm>> {
    if value.len() < 8 || LittleEndian::read_u32(&value[0..4]) != IO_REPARSE_TAG_WOF {
        return Ok(None);
    }
    // REPARSE_DATA_BUFFER header, WOF_EXTERNAL_INFO, FILE_PROVIDER_EXTERNAL_INFO_V1
    if value.len() < 24 {
        return Err(ForgeError::corrupt("wof reparse point", format!("{} bytes", value.len())));
    }
    if LittleEndian::read_u32(&value[12..16]) != WOF_PROVIDER_FILE {
        return Ok(None);
    }
    let raw = LittleEndian::read_u32(&value[20..24]);
    WofAlgorithm::from_raw(raw)
        .map(Some)
        .ok_or_else(|| ForgeError::corrupt("wof reparse point", format!("algorithm {}", raw)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WofChunk {
    /// Offset in the compressed stream.
    pub offset: u64,
    /// Stored size.
    pub size: u64,
    /// Bytes the chunk expands to.
    pub expected: u64,
}

/// Chunk layout of a `WofCompressedData` stream.
#[derive(Debug, Clone, Copy)]
pub struct WofChunks {
    algorithm: WofAlgorithm,
    compressed_size: u64,
    uncompressed_size: u64,
}

impl WofChunks {
    pub fn new(algorithm: WofAlgorithm, compressed_size: u64, uncompressed_size: u64) -> Self {
        Self {
            algorithm,
            compressed_size,
            uncompressed_size,
        }
    }

    pub fn chunk_count(&self) -> u64 {
        self.uncompressed_size.div_ceil(self.algorithm.chunk_size())
    }

    /// Entries are 64-bit once the file reaches 4 GiB.
    pub fn offset_size(&self) -> u64 {
        if self.uncompressed_size >= u64::from(u32::MAX) {
            8
        } else {
            4
        }
    }

    /// The first chunk starts right after the table, so it has no entry.
    pub fn table_size(&self) -> u64 {
        self.chunk_count().saturating_sub(1) * self.offset_size()
    }

    pub fn last_chunk_size(&self) -> u64 {
        match self.uncompressed_size {
            0 => 0,
            n => ((n - 1) & (self.algorithm.chunk_size() - 1)) + 1,
        }
    }

    /// Resolves every chunk from the offset table at the start of the stream.
    pub fn locate(&self, table: &[u8]) -> Result<Vec<WofChunk>> {
        let count = self.chunk_count();
        if count == 0 {
            return Ok(Vec::new());
        }
        let table_size = self.table_size();
        if (table.len() as u64) < table_size {
            return Err(ForgeError::corrupt(
                "wof chunk table",
                format!("{} bytes, {} needed for {} chunks", table.len(), table_size, count),
            ));
        }
        if table_size > self.compressed_size {
            return Err(ForgeError::corrupt("wof chunk table", "larger than the compressed stream"));
        }

        let width = self.offset_size() as usize;
        let mut starts = Vec::new();
        starts
            .try_reserve_exact(count as usize)
            .map_err(|_| ForgeError::corrupt("wof chunk table", format!("{} chunks", count)))?;
        starts.push(table_size);
        for entry in table[..table_size as usize].chunks_exact(width) {
            let relative = if width == 8 {
                LittleEndian::read_u64(entry)
            } else {
                u64::from(LittleEndian::read_u32(entry))
            };
            let start = relative
                .checked_add(table_size)
                .ok_or_else(|| ForgeError::corrupt("wof chunk table", "offset overflow"))?;
            starts.push(start);
        }

        let chunk_size = self.algorithm.chunk_size();
        let mut chunks = Vec::with_capacity(starts.len());
        for (i, start) in starts.iter().enumerate() {
            let end = starts.get(i + 1).copied().unwrap_or(self.compressed_size);
            if end < *start || end > self.compressed_size {
                return Err(ForgeError::corrupt(
                    "wof chunk table",
                    format!("chunk {} spans {:#x}..{:#x} of {:#x}", i, start, end, self.compressed_size),
                ));
            }
            let size = end - start;
            if size >= MAX_CHUNK_SIZE {
                return Err(ForgeError::corrupt("wof chunk table", format!("chunk {} of {} bytes", i, size)));
            }
            let expected = if i as u64 + 1 == count {
                self.last_chunk_size()
            } else {
                chunk_size
            };
            chunks.push(WofChunk {
                offset: *start,
                size,
                expected,
            });
        }
        Ok(chunks)
    }
}

/// Expands a whole `WofCompressedData` stream to `uncompressed_size` bytes.
///
/// A chunk stored at its full expanded size is raw. Every other chunk must decode
/// to exactly its expected size.
pub fn decode_wof_stream(algorithm: WofAlgorithm, compressed: &[u8], uncompressed_size: u64) -> Result<Vec<u8>> {
    let codec: &dyn Decompressor = match algorithm {
        WofAlgorithm::Xpress4k | WofAlgorithm::Xpress8k | WofAlgorithm::Xpress16k => &XpressHuffman,
        WofAlgorithm::Lzx => {
            return Err(ForgeError::InvalidArgument(format!(
                "wof algorithm {} is not supported",
                algorithm
            )))
        }
    };
    let layout = WofChunks::new(algorithm, compressed.len() as u64, uncompressed_size);
    let chunks = layout.locate(compressed)?;

    let capacity = usize::try_from(uncompressed_size).map_err(|_| ForgeError::corrupt("wof stream", "size exceeds memory"))?;
    let mut data = Vec::new();
    data.try_reserve_exact(capacity)
        .map_err(|_| ForgeError::corrupt("wof stream", format!("cannot allocate {:#x} bytes", uncompressed_size)))?;

    for (i, chunk) in chunks.iter().enumerate() {
        let input = &compressed[chunk.offset as usize..(chunk.offset + chunk.size) as usize];
        let expected = chunk.expected as usize;
        if chunk.size == chunk.expected {
            data.extend_from_slice(input);
            continue;
        }
        let start = data.len();
        data.resize(start + expected, 0);
        let written = codec.decompress(input, &mut data[start..])?;
        if written != expected {
            return Err(ForgeError::corrupt(
                "wof stream",
                format!("chunk {} decoded to {} bytes, expected {}", i, written, expected),
            ));
        }
    }
    Ok(data)
}
