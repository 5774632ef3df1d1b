//! Copy-on-write resolution across a chain of shadow copies.
//!
//! Layers are held newest first. The view of layer `k` consults layer `k`, then every
//! older layer, then the live volume. The first layer holding a block wins.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::io::{check_bounds, SectorReader};

use super::format::{StoreIndexEntry, VSS_BLOCK_SIZE};

const SECTOR: u64 = 512;

/// Where the preserved copy of one original block lives.
///
/// An unresolved forwarder keeps `forward` set and points at another original
/// offset, which is then read from the live volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyOnWrite {
    pub data_offset: u64,
    pub forward: bool,
}

/// Individual sectors of a block replaced in one layer only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overlay {
    pub data_offset: u64,
    pub bitmap: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ShadowLayer {
    cows: HashMap<u64, CopyOnWrite>,
    forwarders: HashMap<u64, u64>,
    overlays: HashMap<u64, Overlay>,
    bitmap: Option<Vec<u8>>,
}

impl ShadowLayer {
    /// Builds a layer from store index entries in on-disk order.
    pub fn from_store_entries<'a, I>(entries: I) -> Self
    where
        I: IntoIterator<Item = &'a StoreIndexEntry>,
    {
        let mut layer = Self::default();
        for entry in entries {
            if entry.is_overlay() {
                layer.add_overlay(entry);
            } else {
                layer.add_copy_on_write(entry);
            }
        }
        layer
    }

    fn add_overlay(&mut self, entry: &StoreIndexEntry) {
        if entry.relative_offset != 1 {
            self.overlays.insert(
                entry.original_offset,
                Overlay {
                    data_offset: entry.data_offset,
                    bitmap: entry.overlay_bitmap,
                },
            );
        } else if let Some(overlay) = self.overlays.get_mut(&entry.original_offset) {
            // continuation of an earlier overlay at the same store block
            if overlay.data_offset == entry.data_offset {
                overlay.bitmap |= entry.overlay_bitmap;
            }
        }
    }

    fn add_copy_on_write(&mut self, entry: &StoreIndexEntry) {
        let forward = entry.is_forwarder();
        let data_offset = if forward {
            entry.relative_offset
        } else {
            entry.data_offset
        };
        let mut offset = entry.original_offset;
        if let Some(source) = self.forwarders.remove(&offset) {
            offset = source;
        }
        self.cows.insert(offset, CopyOnWrite { data_offset, forward });
        if forward {
            if offset != data_offset {
                self.forwarders.insert(data_offset, offset);
            } else {
                self.cows.remove(&offset);
            }
        }
    }

    /// Sets the free-block bitmap. With a previous generation the effective bitmap is
    /// the AND of both; bytes past the shorter one count as all-set.
    pub fn with_bitmaps(mut self, current: Vec<u8>, previous: Option<Vec<u8>>) -> Self {
        let bitmap = match previous {
            None => current,
            Some(previous) => {
                let len = current.len().max(previous.len());
                (0..len)
                    .map(|i| current.get(i).copied().unwrap_or(0xFF) & previous.get(i).copied().unwrap_or(0xFF))
                    .collect()
            }
        };
        self.bitmap = Some(bitmap);
        self
    }

    pub fn copy_on_write(&self, original_offset: u64) -> Option<CopyOnWrite> {
        self.cows.get(&original_offset).copied()
    }

    pub fn overlay(&self, original_offset: u64) -> Option<Overlay> {
        self.overlays.get(&original_offset).copied()
    }

    pub fn bitmap(&self) -> Option<&[u8]> {
        self.bitmap.as_deref()
    }

    pub fn block_count(&self) -> usize {
        self.cows.len()
    }

    fn clear_forwarded_blocks(&mut self) {
        let Some(bitmap) = self.bitmap.as_mut() else {
            return;
        };
        for target in self.forwarders.keys() {
            let index = target / VSS_BLOCK_SIZE;
            if let Some(byte) = bitmap.get_mut((index / 8) as usize) {
                *byte &= !(1u8 << (index % 8));
            }
        }
    }
}

/// What one block of a snapshot view is made of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockMap {
    pub copy_on_write: Option<CopyOnWrite>,
    pub overlay: Option<Overlay>,
    /// `None` when the layer keeps no bitmap and free blocks read through.
    pub free: Option<bool>,
}

impl BlockMap {
    /// Volume offset backing one sector of the block, `None` for zeros.
    fn sector_source(&self, block_offset: u64, sector: u64) -> Option<u64> {
        let within = sector * SECTOR;
        if let Some(overlay) = self.overlay {
            if overlay.bitmap & (1u32 << sector) != 0 {
                return Some(overlay.data_offset + within);
            }
        }
        if let Some(cow) = self.copy_on_write {
            return Some(cow.data_offset + within);
        }
        match self.free {
            Some(true) => None,
            _ => Some(block_offset + within),
        }
    }
}

#[derive(Debug, Default)]
pub struct ShadowChain {
    layers: Vec<ShadowLayer>,
}

impl ShadowChain {
    /// `layers` must be ordered newest first.
    pub fn new(mut layers: Vec<ShadowLayer>) -> Self {
        resolve_forwarders(&mut layers);
        if layers.len() == 1 {
            layers[0].clear_forwarded_blocks();
        }
        Self { layers }
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layer(&self, index: usize) -> Option<&ShadowLayer> {
        self.layers.get(index)
    }

    /// Resolves one 16 KiB block as seen from layer `index`.
    pub fn block_map(&self, index: usize, block_offset: u64) -> BlockMap {
        let copy_on_write = self
            .layers
            .iter()
            .skip(index)
            .find_map(|layer| layer.copy_on_write(block_offset));
        let active = self.layers.get(index);
        let free = active.and_then(|layer| layer.bitmap()).map(|bitmap| {
            let block = block_offset / VSS_BLOCK_SIZE;
            match bitmap.get((block / 8) as usize) {
                Some(byte) => byte & (1u8 << (block % 8)) != 0,
                None => true,
            }
        });
        BlockMap {
            copy_on_write,
            overlay: active.and_then(|layer| layer.overlay(block_offset)),
            free,
        }
    }
}

fn resolve_forwarders(layers: &mut [ShadowLayer]) {
    for index in 0..layers.len() {
        let (head, older) = layers.split_at_mut(index + 1);
        let layer = &mut head[index];
        for cow in layer.cows.values_mut().filter(|cow| cow.forward) {
            let mut resolved = *cow;
            for next in older.iter() {
                if let Some(found) = next.copy_on_write(resolved.data_offset) {
                    resolved = found;
                    if !resolved.forward {
                        break;
                    }
                }
            }
            *cow = resolved;
        }
    }
}

/// Read-only view of a volume as it was when one snapshot was taken.
///
/// Store blocks and live blocks both come from `reader`, the volume holding
/// the shadow storage.
pub struct ShadowCopyView<R> {
    reader: R,
    chain: Arc<ShadowChain>,
    index: usize,
    volume_size: u64,
}

impl<R: SectorReader> ShadowCopyView<R> {
    pub fn new(reader: R, chain: Arc<ShadowChain>, index: usize, volume_size: u64) -> Self {
        Self {
            reader,
            chain,
            index,
            volume_size,
        }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    fn read_block_part(&mut self, block_offset: u64, within: u64, out: &mut [u8]) -> Result<()> {
        let map = self.chain.block_map(self.index, block_offset);
        let mut done = 0usize;
        while done < out.len() {
            let position = within + done as u64;
            let sector = position / SECTOR;
            let sector_skip = position % SECTOR;
            let take = ((SECTOR - sector_skip) as usize).min(out.len() - done);
            let chunk = &mut out[done..done + take];
            match map.sector_source(block_offset, sector) {
                Some(source) => self.reader.read_at(source + sector_skip, chunk)?,
                None => chunk.fill(0),
            }
            done += take;
        }
        Ok(())
    }
}

impl<R: SectorReader> SectorReader for ShadowCopyView<R> {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_bounds(offset, buf.len(), self.volume_size)?;
        let mut done = 0usize;
        while done < buf.len() {
            let position = offset + done as u64;
            let block_offset = position - position % VSS_BLOCK_SIZE;
            let within = position - block_offset;
            let take = ((VSS_BLOCK_SIZE - within) as usize).min(buf.len() - done);
            self.read_block_part(block_offset, within, &mut buf[done..done + take])?;
            done += take;
        }
        Ok(())
    }

    fn len(&self) -> u64 {
        self.volume_size
    }

    fn sector_size(&self) -> u32 {
        self.reader.sector_size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryReader;
    use crate::shadow::format::{STORE_FLAG_FORWARDER, STORE_FLAG_OVERLAY};

    const BLOCK: u64 = VSS_BLOCK_SIZE;
    const VOLUME: u64 = 8 * BLOCK;

    fn entry(original: u64, relative: u64, data: u64, flags: u32, bitmap: u32) -> StoreIndexEntry {
        StoreIndexEntry {
            original_offset: original,
            relative_offset: relative,
            data_offset: data,
            flags,
            overlay_bitmap: bitmap,
        }
    }

    /// Live blocks 0..4 hold their index; store blocks 4..8 hold 0xA0 + index.
    fn volume() -> MemoryReader {
        let mut bytes = vec![0u8; VOLUME as usize];
        for (i, block) in bytes.chunks_mut(BLOCK as usize).enumerate() {
            block.fill(if i < 4 { i as u8 } else { 0xA0 + i as u8 });
        }
        MemoryReader::new(bytes)
    }

    fn read_block(view: &mut ShadowCopyView<MemoryReader>, block: u64) -> Vec<u8> {
        view.read_sectors(block * BLOCK, BLOCK as usize).unwrap()
    }

    #[test]
    fn chain_resolves_newest_to_oldest() {
        // newest first: S3, S2, S1; block 1 is preserved only by S2
        let s3 = ShadowLayer::from_store_entries(&[entry(2 * BLOCK, 0, 6 * BLOCK, 0, 0)]);
        let s2 = ShadowLayer::from_store_entries(&[entry(BLOCK, 0, 5 * BLOCK, 0, 0)]);
        let s1 = ShadowLayer::from_store_entries(&[entry(3 * BLOCK, 0, 7 * BLOCK, 0, 0)]);
        let chain = Arc::new(ShadowChain::new(vec![s3, s2, s1]));

        let mut newest = ShadowCopyView::new(volume(), chain.clone(), 0, VOLUME);
        assert!(read_block(&mut newest, 1).iter().all(|b| *b == 0xA5));
        assert!(read_block(&mut newest, 3).iter().all(|b| *b == 0xA7));
        assert!(read_block(&mut newest, 0).iter().all(|b| *b == 0));

        let mut oldest = ShadowCopyView::new(volume(), chain, 2, VOLUME);
        assert!(read_block(&mut oldest, 1).iter().all(|b| *b == 1));
        assert!(read_block(&mut oldest, 2).iter().all(|b| *b == 2));
    }

    #[test]
    fn overlay_replaces_selected_sectors() {
        let layer = ShadowLayer::from_store_entries(&[
            entry(0, 0, 4 * BLOCK, 0, 0),
            entry(0, 0, 5 * BLOCK, STORE_FLAG_OVERLAY, 0b01),
            entry(0, 1, 5 * BLOCK, STORE_FLAG_OVERLAY, 0b100),
        ]);
        assert_eq!(layer.overlay(0).unwrap().bitmap, 0b101);
        let chain = Arc::new(ShadowChain::new(vec![layer]));
        let mut view = ShadowCopyView::new(volume(), chain, 0, VOLUME);

        let block = read_block(&mut view, 0);
        assert!(block[..512].iter().all(|b| *b == 0xA5));
        assert!(block[512..1024].iter().all(|b| *b == 0xA4));
        assert!(block[1024..1536].iter().all(|b| *b == 0xA5));
        assert!(block[1536..].iter().all(|b| *b == 0xA4));
    }

    #[test]
    fn overlays_stay_in_their_own_layer() {
        let newer = ShadowLayer::default();
        let older = ShadowLayer::from_store_entries(&[entry(0, 0, 5 * BLOCK, STORE_FLAG_OVERLAY, u32::MAX)]);
        let chain = Arc::new(ShadowChain::new(vec![newer, older]));
        let mut view = ShadowCopyView::new(volume(), chain, 0, VOLUME);
        assert!(read_block(&mut view, 0).iter().all(|b| *b == 0));
    }

    #[test]
    fn free_blocks_read_as_zeros() {
        let layer = ShadowLayer::default().with_bitmaps(vec![0b0000_0100], None);
        let chain = Arc::new(ShadowChain::new(vec![layer]));
        let mut view = ShadowCopyView::new(volume(), chain, 0, VOLUME);
        assert!(read_block(&mut view, 1).iter().all(|b| *b == 1));
        assert!(read_block(&mut view, 2).iter().all(|b| *b == 0));

        let empty = ShadowLayer::default().with_bitmaps(Vec::new(), None);
        let chain = Arc::new(ShadowChain::new(vec![empty]));
        let mut view = ShadowCopyView::new(volume(), chain, 0, VOLUME);
        // past the end of the bitmap
        assert!(read_block(&mut view, 1).iter().all(|b| *b == 0));
    }

    #[test]
    fn previous_bitmap_is_combined_with_and() {
        let layer = ShadowLayer::default().with_bitmaps(vec![0b0110], Some(vec![0b0011, 0x0F]));
        assert_eq!(layer.bitmap().unwrap(), &[0b0010, 0x0F]);
    }

    #[test]
    fn forwarder_resolves_through_older_layer() {
        let newer = ShadowLayer::from_store_entries(&[entry(BLOCK, 2 * BLOCK, 0, STORE_FLAG_FORWARDER, 0)]);
        let older = ShadowLayer::from_store_entries(&[entry(2 * BLOCK, 0, 6 * BLOCK, 0, 0)]);
        let chain = Arc::new(ShadowChain::new(vec![newer, older]));
        assert_eq!(
            chain.layer(0).unwrap().copy_on_write(BLOCK),
            Some(CopyOnWrite {
                data_offset: 6 * BLOCK,
                forward: false
            })
        );
        let mut view = ShadowCopyView::new(volume(), chain, 0, VOLUME);
        assert!(read_block(&mut view, 1).iter().all(|b| *b == 0xA6));
    }

    #[test]
    fn unresolved_forwarder_reads_live_target() {
        let layer = ShadowLayer::from_store_entries(&[entry(BLOCK, 3 * BLOCK, 0, STORE_FLAG_FORWARDER, 0)])
            .with_bitmaps(vec![0xFF], None);
        let chain = Arc::new(ShadowChain::new(vec![layer]));
        // the forwarded block is no longer free in a single-snapshot chain
        assert_eq!(chain.layer(0).unwrap().bitmap().unwrap(), &[0b1111_0111]);
        let mut view = ShadowCopyView::new(volume(), chain, 0, VOLUME);
        assert!(read_block(&mut view, 1).iter().all(|b| *b == 3));
        assert!(read_block(&mut view, 3).iter().all(|b| *b == 3));
    }

    #[test]
    fn unaligned_read_spans_blocks() {
        let layer = ShadowLayer::from_store_entries(&[entry(BLOCK, 0, 5 * BLOCK, 0, 0)]);
        let chain = Arc::new(ShadowChain::new(vec![layer]));
        let mut view = ShadowCopyView::new(volume(), chain, 0, VOLUME);
        let bytes = view.read_sectors(BLOCK - 100, 200).unwrap();
        assert!(bytes[..100].iter().all(|b| *b == 0));
        assert!(bytes[100..].iter().all(|b| *b == 0xA5));
        assert!(view.read_sectors(VOLUME - 10, 20).is_err());
    }
}
