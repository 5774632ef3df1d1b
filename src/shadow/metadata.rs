//! Shadow copies read straight from on-disk shadow storage, without the
//! snapshot service. Works on images and volumes taken from other hosts.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::debug;
use uuid::Uuid;

use super::chain::{ShadowChain, ShadowLayer};
use super::format::{
    parse_store_entries, BlockHeader, CatalogEntry, DiffAreaEntry, RecordType, SnapshotInfoEntry, StoreIndexEntry,
    StoreInfo, VolumeHeader, BLOCK_HEADER_SIZE, CATALOG_ENTRY_SIZE, SNAPSHOT_FLAG_ZERO_FREE_BLOCKS, VOLUME_HEADER_OFFSET,
    VSS_BLOCK_SIZE,
};
use super::{Backing, ParserType, ShadowCopy, ShadowCopyParser, StoreLocation, VolumeSnapshotAttributes};
use crate::context::ScanContext;
use crate::error::{ForgeError, Result};
use crate::io::SectorReader;
use crate::location::VolumeLocation;

/// A catalog pair: the snapshot and the diff area holding its blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreDescriptor {
    pub snapshot: SnapshotInfoEntry,
    pub diff_area: DiffAreaEntry,
    pub info: Option<StoreInfo>,
}

impl StoreDescriptor {
    pub fn guid(&self) -> Uuid {
        self.snapshot.guid
    }

    fn zeroes_free_blocks(&self) -> bool {
        self.snapshot.flags & SNAPSHOT_FLAG_ZERO_FREE_BLOCKS != 0
    }
}

/// The shadow storage of one volume.
#[derive(Debug, Clone)]
pub struct VssStore {
    header: VolumeHeader,
    descriptors: Vec<StoreDescriptor>,
}

impl VssStore {
    /// Reads the volume header and catalog. `None` when the volume carries no
    /// shadow storage at all.
    pub fn load<R: SectorReader + ?Sized>(reader: &mut R, ctx: &ScanContext) -> Result<Option<Self>> {
        if reader.len() < VOLUME_HEADER_OFFSET + 512 {
            return Ok(None);
        }
        let raw = reader.read_sectors(VOLUME_HEADER_OFFSET, 512)?;
        let header = match BlockHeader::parse(&raw) {
            Ok(_) => VolumeHeader::parse(&raw)?,
            Err(_) => return Ok(None),
        };
        let mut store = Self {
            header,
            descriptors: Vec::new(),
        };
        if store.header.has_catalog() {
            store.descriptors = read_catalog(reader, ctx, store.header.catalog_offset)?;
            for descriptor in &mut store.descriptors {
                descriptor.info = read_store_info(reader, ctx, &descriptor.diff_area);
            }
        }
        debug!("shadow storage holds {} snapshot(s)", store.descriptors.len());
        Ok(Some(store))
    }

    pub fn header(&self) -> &VolumeHeader {
        &self.header
    }

    /// Catalog pairs, newest first.
    pub fn descriptors(&self) -> &[StoreDescriptor] {
        &self.descriptors
    }

    /// Reads every store index and bitmap and builds the chain. Snapshots whose
    /// store cannot be read are dropped with a diagnostic; the returned
    /// descriptors line up with the chain's layers.
    pub fn build_chain<R: SectorReader + ?Sized>(
        &self,
        reader: &mut R,
        ctx: &ScanContext,
    ) -> Result<(ShadowChain, Vec<StoreDescriptor>)> {
        let mut layers = Vec::with_capacity(self.descriptors.len());
        let mut kept = Vec::with_capacity(self.descriptors.len());
        for descriptor in &self.descriptors {
            match read_layer(reader, ctx, descriptor) {
                Ok(layer) => {
                    layers.push(layer);
                    kept.push(descriptor.clone());
                }
                Err(ForgeError::Cancelled) => return Err(ForgeError::Cancelled),
                Err(err) => ctx.warn(
                    "shadow storage",
                    format!("snapshot {{{}}} dropped: {}", descriptor.guid(), err),
                ),
            }
        }
        Ok((ShadowChain::new(layers), kept))
    }
}

/// Reads a chain of 16 KiB blocks of one record type, following next offsets.
fn read_block_chain<R: SectorReader + ?Sized>(
    reader: &mut R,
    ctx: &ScanContext,
    first: u64,
    kind: RecordType,
) -> Result<Vec<Vec<u8>>> {
    let mut blocks = Vec::new();
    let mut seen = HashSet::new();
    let mut offset = first;
    while offset != 0 {
        ctx.check_cancelled()?;
        if !seen.insert(offset) {
            return Err(ForgeError::corrupt(
                "vss block chain",
                format!("{:?} chain loops back to {:#x}", kind, offset),
            ));
        }
        let block = reader.read_sectors(offset, VSS_BLOCK_SIZE as usize)?;
        let header = BlockHeader::parse(&block)?.require_type(kind)?;
        offset = header.next_offset;
        blocks.push(block);
    }
    Ok(blocks)
}

fn read_catalog<R: SectorReader + ?Sized>(
    reader: &mut R,
    ctx: &ScanContext,
    catalog_offset: u64,
) -> Result<Vec<StoreDescriptor>> {
    let mut snapshots: Vec<SnapshotInfoEntry> = Vec::new();
    let mut areas: HashMap<Uuid, DiffAreaEntry> = HashMap::new();

    'blocks: for block in read_block_chain(reader, ctx, catalog_offset, RecordType::Catalog)? {
        for raw in block[BLOCK_HEADER_SIZE..].chunks_exact(CATALOG_ENTRY_SIZE) {
            match CatalogEntry::parse(raw) {
                Ok(CatalogEntry::End) => continue 'blocks,
                Ok(CatalogEntry::Free) => {}
                Ok(CatalogEntry::SnapshotInfo(info)) => snapshots.push(info),
                Ok(CatalogEntry::DiffArea(area)) => {
                    areas.insert(area.guid, area);
                }
                Ok(CatalogEntry::Unknown(kind)) => ctx.debug("vss catalog", format!("skipping entry type {}", kind)),
                Err(err) => ctx.warn("vss catalog", err.to_string()),
            }
        }
    }

    let mut descriptors = Vec::with_capacity(snapshots.len());
    for snapshot in snapshots {
        match areas.remove(&snapshot.guid) {
            Some(diff_area) => descriptors.push(StoreDescriptor {
                snapshot,
                diff_area,
                info: None,
            }),
            None => ctx.warn(
                "vss catalog",
                format!("snapshot {{{}}} has no diff area entry", snapshot.guid),
            ),
        }
    }
    for guid in areas.keys() {
        ctx.warn("vss catalog", format!("diff area {{{}}} has no snapshot entry", guid));
    }

    descriptors.sort_by(|a, b| {
        b.snapshot
            .creation_time
            .cmp(&a.snapshot.creation_time)
            .then(b.snapshot.position.cmp(&a.snapshot.position))
    });
    Ok(descriptors)
}

fn read_store_info<R: SectorReader + ?Sized>(
    reader: &mut R,
    ctx: &ScanContext,
    area: &DiffAreaEntry,
) -> Option<StoreInfo> {
    let parsed = reader
        .read_sectors(area.store_header_offset, VSS_BLOCK_SIZE as usize)
        .and_then(|block| StoreInfo::parse(&block));
    match parsed {
        Ok(info) => Some(info),
        Err(err) => {
            ctx.warn("vss store header", format!("snapshot {{{}}}: {}", area.guid, err));
            None
        }
    }
}

fn read_store_entries<R: SectorReader + ?Sized>(
    reader: &mut R,
    ctx: &ScanContext,
    area: &DiffAreaEntry,
) -> Result<Vec<StoreIndexEntry>> {
    let blocks = read_block_chain(reader, ctx, area.store_index_offset, RecordType::StoreIndex)?;
    Ok(blocks.iter().flat_map(|block| parse_store_entries(block)).collect())
}

/// One bit per 16 KiB block, trimmed to the snapshot's volume size.
fn read_bitmap<R: SectorReader + ?Sized>(
    reader: &mut R,
    ctx: &ScanContext,
    offset: u64,
    volume_size: u64,
) -> Result<Vec<u8>> {
    let mut bitmap: Vec<u8> = read_block_chain(reader, ctx, offset, RecordType::StoreBitmap)?
        .iter()
        .flat_map(|block| block[BLOCK_HEADER_SIZE..].iter().copied())
        .collect();
    let blocks = volume_size.div_ceil(VSS_BLOCK_SIZE);
    bitmap.truncate(blocks.div_ceil(8) as usize);
    Ok(bitmap)
}

fn read_layer<R: SectorReader + ?Sized>(
    reader: &mut R,
    ctx: &ScanContext,
    descriptor: &StoreDescriptor,
) -> Result<ShadowLayer> {
    let area = &descriptor.diff_area;
    let entries = read_store_entries(reader, ctx, area)?;
    let layer = ShadowLayer::from_store_entries(&entries);
    if !descriptor.zeroes_free_blocks() {
        return Ok(layer);
    }
    let size = descriptor.snapshot.volume_size;
    let current = read_bitmap(reader, ctx, area.bitmap_offset, size)?;
    let previous = match area.previous_bitmap_offset {
        Some(offset) => Some(read_bitmap(reader, ctx, offset, size)?),
        None => None,
    };
    Ok(layer.with_bitmaps(current, previous))
}

/// Reads shadow storage from the volume's own blocks.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetadataShadowParser;

impl MetadataShadowParser {
    pub fn new() -> Self {
        Self
    }
}

impl ShadowCopyParser for MetadataShadowParser {
    fn parser_type(&self) -> ParserType {
        ParserType::Internal
    }

    fn enumerate(&self, ctx: &ScanContext, location: &VolumeLocation) -> Result<Vec<ShadowCopy>> {
        let mut reader = location.open()?;
        let Some(store) = VssStore::load(&mut reader, ctx)? else {
            ctx.debug(location.path(), "no shadow storage");
            return Ok(Vec::new());
        };
        let (chain, descriptors) = store.build_chain(&mut reader, ctx)?;
        let chain = Arc::new(chain);

        let copies = descriptors
            .into_iter()
            .enumerate()
            .map(|(index, descriptor)| {
                let layer_blocks = chain.layer(index).map_or(0, ShadowLayer::block_count);
                let info = descriptor.info;
                ShadowCopy {
                    id: descriptor.snapshot.guid,
                    set_id: info.as_ref().map_or(Uuid::nil(), |i| i.shadow_copy_set_id),
                    volume_serial: location.serial_number(),
                    fs_type: location.fs_type(),
                    parser_type: ParserType::Internal,
                    creation_time: descriptor.snapshot.creation_time,
                    store_location: StoreLocation::DiffArea {
                        volume: location.path().to_string(),
                        store_index_offset: descriptor.diff_area.store_index_offset,
                        store_file_reference: descriptor.diff_area.store_file_reference,
                    },
                    volume_size: descriptor.snapshot.volume_size,
                    chain_index: index,
                    layer_position: Some(descriptor.snapshot.position),
                    attributes: info.as_ref().map_or(VolumeSnapshotAttributes::default(), |i| i.attributes),
                    machine: info.as_ref().map(|i| i.machine.clone()),
                    service: info.as_ref().map(|i| i.service.clone()),
                    preserved_blocks: layer_blocks,
                    backing: Backing::Chain {
                        volume: location.clone(),
                        chain: chain.clone(),
                        index,
                    },
                }
            })
            .collect();
        Ok(copies)
    }
}
