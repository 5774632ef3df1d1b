use log::{debug, info};

use super::attributes::{
    parse_attribute_list, Attribute, AttributeListEntry, DataAttribute, FileReference, ATTRIBUTE_LIST, DATA,
    REPARSE_POINT,
};
use super::boot::NtfsBootSector;
use super::cache::RecordCache;
use super::record::{MftRecord, MftRecordParser};
use super::runlist::{lookup_vcn, DataRun};
use super::sizer::get_stream_size;
use crate::compression::wof::{decode_wof_stream, parse_wof_reparse, WOF_STREAM_NAME};
use crate::compression::{classify_units, Lznt1, UnitDecoder, UnitKind};
use crate::context::ScanContext;
use crate::error::{ForgeError, Result};
use crate::io::SectorReader;

const MFT_RECORD: u64 = 0;
const LZNT1_CHUNK: u64 = 0x1000;

/// Outcome of a record walk; per-record failures are counted, not fatal.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WalkSummary {
    pub parsed: u64,
    pub empty: u64,
    pub failed: u64,
}

/// An NTFS volume read through a [`SectorReader`], located by its boot sector.
pub struct NtfsVolume<R> {
    reader: R,
    boot: NtfsBootSector,
    record_size: usize,
    parser: MftRecordParser,
    mft_runs: Vec<DataRun>,
    mft_size: u64,
    cluster_count: u64,
}

/// An allocated run must lie inside the volume.
fn check_run_bounds(run: &DataRun, cluster_count: u64) -> Result<()> {
    let Some(lcn) = run.lcn else {
        return Ok(());
    };
    match lcn.checked_add(run.length) {
        Some(end) if end <= cluster_count => Ok(()),
        _ => Err(ForgeError::corrupt(
            "run list",
            format!(
                "run of {:#x} clusters at lcn {:#x} ends past the volume ({:#x} clusters)",
                run.length, lcn, cluster_count
            ),
        )),
    }
}

/// A nonresident size must fit both the allocation and the clusters the runs map.
fn check_stream_size(size: u64, allocated: u64, runs: &[DataRun], bpc: u64) -> Result<()> {
    if size > allocated {
        return Err(ForgeError::corrupt(
            "stream",
            format!("size {:#x} exceeds allocated length {:#x}", size, allocated),
        ));
    }
    let mapped = runs
        .iter()
        .map(DataRun::vcn_end)
        .max()
        .unwrap_or(0)
        .saturating_mul(bpc);
    if size > mapped {
        return Err(ForgeError::corrupt(
            "stream",
            format!("size {:#x} exceeds the {:#x} bytes its runs map", size, mapped),
        ));
    }
    Ok(())
}

fn zeroed_buffer(size: u64) -> Result<Vec<u8>> {
    let size = usize::try_from(size).map_err(|_| ForgeError::corrupt("stream", "size exceeds memory"))?;
    let mut data = Vec::new();
    data.try_reserve_exact(size)
        .map_err(|_| ForgeError::corrupt("stream", format!("cannot allocate {:#x} bytes", size)))?;
    data.resize(size, 0);
    Ok(data)
}

impl<R: SectorReader> NtfsVolume<R> {
    pub fn open(mut reader: R, ctx: &ScanContext) -> Result<Self> {
        let vbr = reader.read_sectors(0, 512)?;
        let boot = NtfsBootSector::parse(&vbr).ok_or_else(|| ForgeError::corrupt("boot sector", "not NTFS"))?;
        let record_size = boot.validate()?;
        let bpc = boot.bytes_per_cluster();
        let parser = MftRecordParser::new(boot.bytes_per_sector);
        let cluster_count = boot.cluster_count();

        let mft_offset = boot
            .mft_lcn
            .checked_mul(bpc)
            .ok_or_else(|| ForgeError::corrupt("boot sector", "$MFT offset overflow"))?;
        let raw = reader.read_sectors(mft_offset, record_size)?;
        let record0 = parser.parse(&raw)?;

        let first = record0
            .attributes_of(DATA)
            .iter()
            .find(|a| a.name.is_empty())
            .ok_or_else(|| ForgeError::corrupt("$MFT", "record 0 has no $DATA"))?;
        let extent = first
            .nonresident()
            .filter(|n| n.is_first_extent())
            .ok_or_else(|| ForgeError::corrupt("$MFT", "$DATA is not a first nonresident extent"))?;

        for run in &extent.runs {
            check_run_bounds(run, cluster_count)?;
        }
        check_stream_size(extent.file_size, extent.allocated_length, &extent.runs, bpc)?;

        let mut volume = Self {
            reader,
            boot,
            record_size,
            parser,
            mft_runs: extent.runs.clone(),
            mft_size: extent.file_size,
            cluster_count,
        };

        // a fragmented $MFT continues its $DATA in extension records
        let list = volume.attribute_list(&record0)?;
        let mut extensions: Vec<&AttributeListEntry> = list
            .iter()
            .filter(|e| e.type_code == DATA && e.name.is_empty() && e.reference.record != MFT_RECORD)
            .collect();
        extensions.sort_by_key(|e| e.start_vcn);
        for entry in extensions {
            ctx.check_cancelled()?;
            volume.extend_mft_runs(entry.reference)?;
        }

        info!(
            "NTFS volume: serial {:#018x}, {} byte clusters, {} MFT records",
            volume.boot.volume_serial_number,
            bpc,
            volume.record_count()
        );
        Ok(volume)
    }

    fn extend_mft_runs(&mut self, reference: FileReference) -> Result<()> {
        let raw = self.read_raw_record(reference.record)?;
        let record = self.parser.parse(&raw)?;
        if record.sequence_number() != reference.sequence {
            return Err(ForgeError::corrupt(
                "$MFT",
                format!("extension record {} was reused", reference.record),
            ));
        }
        for attr in record.attributes_of(DATA).iter().filter(|a| a.name.is_empty()) {
            if let Some(extent) = attr.nonresident() {
                for run in &extent.runs {
                    check_run_bounds(run, self.cluster_count)?;
                    if !self.mft_runs.iter().any(|r| r.vcn_start == run.vcn_start) {
                        self.mft_runs.push(*run);
                    }
                }
            }
        }
        self.mft_runs.sort_by_key(|r| r.vcn_start);
        debug!("$MFT extended from record {}: {} runs", reference.record, self.mft_runs.len());
        Ok(())
    }

    pub fn boot_sector(&self) -> &NtfsBootSector {
        &self.boot
    }

    pub fn serial_number(&self) -> u64 {
        self.boot.volume_serial_number
    }

    pub fn bytes_per_cluster(&self) -> u64 {
        self.boot.bytes_per_cluster()
    }

    pub fn record_size(&self) -> usize {
        self.record_size
    }

    pub fn record_count(&self) -> u64 {
        self.mft_size / self.record_size as u64
    }

    pub fn parser(&self) -> MftRecordParser {
        self.parser
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Reads `buf.len()` bytes of a stream starting at byte `offset`, following `runs`.
    /// Sparse runs read as zeros; a VCN outside the runs is an error.
    pub fn read_stream_range(&mut self, runs: &[DataRun], offset: u64, buf: &mut [u8]) -> Result<()> {
        let bpc = self.bytes_per_cluster();
        let mut logical = offset;
        let mut done = 0usize;
        while done < buf.len() {
            let vcn = logical / bpc;
            let in_cluster = logical % bpc;
            let (run, lcn) = lookup_vcn(runs, vcn)
                .ok_or_else(|| ForgeError::corrupt("stream", format!("vcn {:#x} not mapped", vcn)))?;
            check_run_bounds(run, self.cluster_count)?;
            // stay within the run so the read is physically contiguous
            let run_bytes_left = (run.vcn_end() - vcn)
                .checked_mul(bpc)
                .and_then(|b| b.checked_sub(in_cluster))
                .filter(|b| *b > 0)
                .ok_or_else(|| {
                    ForgeError::corrupt(
                        "run list",
                        format!("run at vcn {:#x} spans {:#x} clusters", run.vcn_start, run.length),
                    )
                })?;
            let take = (buf.len() - done).min(usize::try_from(run_bytes_left).unwrap_or(usize::MAX));
            let chunk = &mut buf[done..done + take];
            match lcn {
                None => chunk.fill(0),
                Some(lcn) => {
                    let physical = lcn
                        .checked_mul(bpc)
                        .and_then(|p| p.checked_add(in_cluster))
                        .ok_or_else(|| ForgeError::corrupt("stream", "physical offset overflow"))?;
                    self.reader.read_at(physical, chunk)?;
                }
            }
            done += take;
            logical += take as u64;
        }
        Ok(())
    }

    pub fn read_raw_record(&mut self, number: u64) -> Result<Vec<u8>> {
        let offset = number
            .checked_mul(self.record_size as u64)
            .filter(|o| *o + self.record_size as u64 <= self.mft_size)
            .ok_or_else(|| ForgeError::corrupt("$MFT", format!("record {} outside the table", number)))?;
        let mut buf = vec![0u8; self.record_size];
        let runs = std::mem::take(&mut self.mft_runs);
        let result = self.read_stream_range(&runs, offset, &mut buf);
        self.mft_runs = runs;
        result.map(|_| buf)
    }

    /// `Ok(None)` for a never-used (zeroed) slot.
    pub fn read_record(&mut self, number: u64) -> Result<Option<MftRecord>> {
        let mut raw = self.read_raw_record(number)?;
        if raw.iter().all(|b| *b == 0) {
            return Ok(None);
        }
        self.parser.parse_in_place(&mut raw).map(Some)
    }

    /// Decodes every record in `range`, handing each outcome to `visit`. Cancellation
    /// is checked before each record.
    pub fn walk_records<F>(&mut self, ctx: &ScanContext, range: std::ops::Range<u64>, mut visit: F) -> Result<WalkSummary>
    where
        F: FnMut(u64, Result<MftRecord>),
    {
        let mut summary = WalkSummary::default();
        let end = range.end.min(self.record_count());
        for number in range.start..end {
            ctx.check_cancelled()?;
            match self.read_record(number) {
                Ok(Some(record)) => {
                    summary.parsed += 1;
                    visit(number, Ok(record));
                }
                Ok(None) => summary.empty += 1,
                Err(e) if e.is_corruption() => {
                    summary.failed += 1;
                    ctx.warn("mft record", format!("record {}: {}", number, e));
                    visit(number, Err(e));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(summary)
    }

    /// Loads `number` and the extension records its attribute list names.
    pub fn load_into_cache(&mut self, cache: &mut RecordCache, number: u64) -> Result<()> {
        let record = self
            .read_record(number)?
            .ok_or_else(|| ForgeError::corrupt("mft record", format!("record {} is empty", number)))?;
        let list = self.attribute_list(&record)?;
        for entry in &list {
            let target = entry.reference.record;
            if target != number && !cache.contains(target) {
                if let Some(ext) = self.read_record(target)? {
                    cache.insert(target, ext);
                }
            }
        }
        if !list.is_empty() {
            cache.insert_attribute_list(number, list);
        }
        cache.insert(number, record);
        Ok(())
    }

    /// `$ATTRIBUTE_LIST` entries of `record`, reading a nonresident list from disk.
    pub fn attribute_list(&mut self, record: &MftRecord) -> Result<Vec<AttributeListEntry>> {
        let Some(attr) = record.first_attribute(ATTRIBUTE_LIST) else {
            return Ok(Vec::new());
        };
        match &attr.data {
            DataAttribute::Resident(r) => parse_attribute_list(&r.value),
            DataAttribute::Nonresident(n) => {
                let size = usize::try_from(n.file_size)
                    .ok()
                    .filter(|s| *s <= 0x10_0000)
                    .ok_or_else(|| ForgeError::corrupt("attribute list", format!("size {}", n.file_size)))?;
                let mut buf = vec![0u8; size];
                self.read_stream_range(&n.runs, 0, &mut buf)?;
                parse_attribute_list(&buf)
            }
        }
    }

    /// Full contents of a stream given all of its extents.
    pub fn read_stream(&mut self, ctx: &ScanContext, extents: &[&Attribute]) -> Result<Vec<u8>> {
        let Some(first) = extents.first() else {
            return Ok(Vec::new());
        };
        if let Some(value) = first.resident_value() {
            return Ok(value.to_vec());
        }
        let size = get_stream_size(extents.iter().copied())
            .ok_or_else(|| ForgeError::corrupt("stream", "first extent missing, size unknown"))?;
        let mut runs: Vec<DataRun> = extents
            .iter()
            .filter_map(|a| a.nonresident())
            .flat_map(|n| n.runs.iter().copied())
            .collect();
        runs.sort_by_key(|r| r.vcn_start);

        let allocated = first.nonresident().map_or(0, |n| n.allocated_length);
        check_stream_size(size, allocated, &runs, self.bytes_per_cluster())?;

        let unit_exponent = first.nonresident().map_or(0, |n| n.compression_unit);
        if first.flags.is_compressed() && unit_exponent != 0 {
            return self.read_compressed(ctx, &runs, unit_exponent, size);
        }

        let mut data = zeroed_buffer(size)?;
        let size = data.len();
        let bpc = self.bytes_per_cluster() as usize;
        // whole clusters at a time so cancellation never splits one
        let step = bpc * 64;
        let mut offset = 0usize;
        while offset < size {
            ctx.check_cancelled()?;
            let take = step.min(size - offset);
            self.read_stream_range(&runs, offset as u64, &mut data[offset..offset + take])?;
            offset += take;
        }
        Ok(data)
    }

    fn read_compressed(&mut self, ctx: &ScanContext, runs: &[DataRun], exponent: u8, size: u64) -> Result<Vec<u8>> {
        let bpc = self.bytes_per_cluster();
        let unit_clusters = 1u64
            .checked_shl(u32::from(exponent))
            .filter(|c| *c <= 64)
            .ok_or_else(|| ForgeError::corrupt("compression unit", format!("exponent {}", exponent)))?;
        let unit_size = usize::try_from(unit_clusters * bpc)
            .map_err(|_| ForgeError::corrupt("compression unit", "unit exceeds memory"))?;
        let decoder = UnitDecoder::new(Lznt1, unit_size)?;

        let capacity = usize::try_from(size).map_err(|_| ForgeError::corrupt("stream", "size exceeds memory"))?;
        let mut data = Vec::new();
        data.try_reserve_exact(capacity)
            .map_err(|_| ForgeError::corrupt("stream", format!("cannot allocate {:#x} bytes", size)))?;
        for unit in classify_units(runs, unit_clusters) {
            ctx.check_cancelled()?;
            let Some(unit_start) = unit.vcn.checked_mul(bpc).filter(|start| *start < size) else {
                break;
            };
            let remaining = size - unit_start;
            let expected = match unit.kind {
                UnitKind::Compressed => remaining.div_ceil(LZNT1_CHUNK) * LZNT1_CHUNK,
                UnitKind::Stored | UnitKind::Sparse => remaining,
            }
            .min(unit_size as u64) as usize;

            let input = match unit.kind {
                UnitKind::Sparse => Vec::new(),
                UnitKind::Stored | UnitKind::Compressed => {
                    let mut input = vec![0u8; (unit.backing_clusters * bpc) as usize];
                    self.read_stream_range(runs, unit_start, &mut input)?;
                    input
                }
            };
            let mut out = vec![0u8; expected];
            decoder.decode(&unit, &input, &mut out)?;
            let keep = (remaining.min(expected as u64)) as usize;
            data.extend_from_slice(&out[..keep]);
        }
        if (data.len() as u64) < size {
            return Err(ForgeError::corrupt(
                "stream",
                format!("compressed runs cover {} of {} bytes", data.len(), size),
            ));
        }
        Ok(data)
    }

    /// Contents of the stream `(type_code, name)` of record `number`, following
    /// attribute lists through `cache`.
    pub fn read_attribute_data(
        &mut self,
        ctx: &ScanContext,
        cache: &RecordCache,
        number: u64,
        type_code: u32,
        name: &str,
    ) -> Result<Vec<u8>> {
        let base = cache
            .get(number)
            .ok_or_else(|| ForgeError::corrupt("mft record", format!("record {} not loaded", number)))?;
        let extents = cache.stream_extents(number, base, type_code, name);
        if extents.is_empty() {
            return Err(ForgeError::corrupt(
                "stream",
                format!("record {} has no {:#x} stream named {:?}", number, type_code, name),
            ));
        }
        self.read_stream(ctx, &extents)
    }

    /// Contents of the unnamed `$DATA` of record `number`. A WOF compressed file is
    /// expanded from its `WofCompressedData` stream to the logical size.
    pub fn read_file_data(&mut self, ctx: &ScanContext, cache: &RecordCache, number: u64) -> Result<Vec<u8>> {
        let base = cache
            .get(number)
            .ok_or_else(|| ForgeError::corrupt("mft record", format!("record {} not loaded", number)))?;
        let reparse = cache.stream_extents(number, base, REPARSE_POINT, "");
        let algorithm = if reparse.is_empty() {
            None
        } else {
            parse_wof_reparse(&self.read_stream(ctx, &reparse)?)?
        };
        let Some(algorithm) = algorithm else {
            return self.read_attribute_data(ctx, cache, number, DATA, "");
        };

        let size = get_stream_size(cache.stream_extents(number, base, DATA, ""))
            .ok_or_else(|| ForgeError::corrupt("wof stream", format!("record {} has no sized $DATA", number)))?;
        let compressed = self.read_attribute_data(ctx, cache, number, DATA, WOF_STREAM_NAME)?;
        ctx.debug(
            "wof stream",
            format!("record {}: {} bytes of {} for {} bytes", number, compressed.len(), algorithm, size),
        );
        decode_wof_stream(algorithm, &compressed, size)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::io::MemoryReader;
    use crate::compression::wof::tests::sample_stream;
    use crate::compression::wof::{WofAlgorithm, IO_REPARSE_TAG_WOF};
    use crate::mft::attributes::tests::{named, nonresident_attribute, resident_attribute};
    use crate::mft::attributes::FILE_NAME;
    use crate::mft::boot::tests::sample_vbr;
    use crate::mft::record::tests::RecordBuilder;

    pub(crate) const CLUSTER: usize = 4096;
    pub(crate) const MFT_LCN: u64 = 4;

    /// A 64-cluster volume: $MFT at cluster 4 holding 8 records, record 5 with a
    /// resident $DATA, record 6 with a two-cluster nonresident $DATA at cluster 20.
    pub(crate) fn sample_volume(serial: u64) -> Vec<u8> {
        let mut image = vec![0u8; 64 * CLUSTER];
        image[..512].copy_from_slice(&sample_vbr(MFT_LCN, 64 * 8, serial));

        let mft_runs = [0x11, 0x02, MFT_LCN as u8];
        let mut records = vec![RecordBuilder::new(0)
            .attribute(nonresident_attribute(DATA, 0, 1, 8 * 1024, 0, &mft_runs))
            .build()];
        for n in 1..8u32 {
            let builder = match n {
                5 => RecordBuilder::new(5)
                    .attribute(resident_attribute(FILE_NAME, 0, &file_name_body("notes.txt")))
                    .attribute(resident_attribute(DATA, 1, b"resident contents")),
                6 => RecordBuilder::new(6).attribute(nonresident_attribute(DATA, 0, 1, 5000, 0, &[0x11, 0x02, 20])),
                7 => {
                    records.push(vec![0u8; 1024]);
                    continue;
                }
                _ => RecordBuilder::new(n),
            };
            records.push(builder.build());
        }
        let mft_start = MFT_LCN as usize * CLUSTER;
        for (i, rec) in records.iter().enumerate() {
            image[mft_start + i * 1024..mft_start + (i + 1) * 1024].copy_from_slice(rec);
        }
        for (i, b) in image[20 * CLUSTER..22 * CLUSTER].iter_mut().enumerate() {
            *b = (i % 253) as u8;
        }
        image
    }

    fn file_name_body(name: &str) -> Vec<u8> {
        let units: Vec<u16> = name.encode_utf16().collect();
        let mut body = vec![0u8; 66 + units.len() * 2];
        body[64] = units.len() as u8;
        body[65] = 1;
        for (i, u) in units.iter().enumerate() {
            body[66 + i * 2..68 + i * 2].copy_from_slice(&u.to_le_bytes());
        }
        body
    }

    #[test]
    fn opens_and_walks_records() {
        let ctx = ScanContext::new();
        let mut volume = NtfsVolume::open(MemoryReader::new(sample_volume(0xABCD)), &ctx).unwrap();
        assert_eq!(volume.serial_number(), 0xABCD);
        assert_eq!(volume.record_count(), 8);

        let mut seen = Vec::new();
        let summary = volume
            .walk_records(&ctx, 0..u64::MAX, |n, rec| seen.push((n, rec.is_ok())))
            .unwrap();
        assert_eq!(summary, WalkSummary { parsed: 7, empty: 1, failed: 0 });
        assert_eq!(seen.len(), 7);

        let record = volume.read_record(5).unwrap().unwrap();
        assert_eq!(record.file_names()[0].name, "notes.txt");
    }

    #[test]
    fn reads_resident_and_nonresident_streams() {
        let ctx = ScanContext::new();
        let mut volume = NtfsVolume::open(MemoryReader::new(sample_volume(1)), &ctx).unwrap();
        let mut cache = RecordCache::new();
        volume.load_into_cache(&mut cache, 5).unwrap();
        volume.load_into_cache(&mut cache, 6).unwrap();

        let resident = volume.read_attribute_data(&ctx, &cache, 5, DATA, "").unwrap();
        assert_eq!(resident, b"resident contents");

        let data = volume.read_attribute_data(&ctx, &cache, 6, DATA, "").unwrap();
        assert_eq!(data.len(), 5000);
        assert_eq!(data[4096], (4096 % 253) as u8);
    }

    #[test]
    fn cancellation_stops_between_records() {
        let ctx = ScanContext::new();
        let mut volume = NtfsVolume::open(MemoryReader::new(sample_volume(1)), &ctx).unwrap();
        let token = ctx.cancel_token();
        let mut visited = 0;
        let err = volume
            .walk_records(&ctx, 0..8, |_, _| {
                visited += 1;
                if visited == 2 {
                    token.cancel();
                }
            })
            .unwrap_err();
        assert!(matches!(err, ForgeError::Cancelled));
        assert_eq!(visited, 2);
    }

    #[test]
    fn reads_compressed_stream() {
        let ctx = ScanContext::new();
        let mut image = sample_volume(1);
        // record 4: compressed $DATA, unit of 16 clusters, 1 cluster of LZNT1 at cluster 30
        let attr = nonresident_attribute(DATA, 0, 15, 6000, 4, &[0x11, 0x01, 30, 0x01, 0x0F]);
        let record = RecordBuilder::new(4).attribute(attr).build();
        let mft_start = MFT_LCN as usize * CLUSTER;
        image[mft_start + 4 * 1024..mft_start + 5 * 1024].copy_from_slice(&record);

        // two chunks: "abc" then "xyz", each completed to 4096 bytes
        let chunk = |s: &[u8]| {
            let mut c = vec![0x03, 0xB0, 0x00];
            c.extend_from_slice(s);
            c
        };
        let mut compressed = chunk(b"abc");
        compressed.extend(chunk(b"xyz"));
        image[30 * CLUSTER..30 * CLUSTER + compressed.len()].copy_from_slice(&compressed);

        let mut volume = NtfsVolume::open(MemoryReader::new(image), &ctx).unwrap();
        let mut cache = RecordCache::new();
        volume.load_into_cache(&mut cache, 4).unwrap();
        let data = volume.read_attribute_data(&ctx, &cache, 4, DATA, "").unwrap();
        assert_eq!(data.len(), 6000);
        assert_eq!(&data[..3], b"abc");
        assert_eq!(&data[4096..4099], b"xyz");
        assert!(data[3..4096].iter().all(|b| *b == 0));
    }

    fn replace_record(image: &mut [u8], number: usize, record: &[u8]) {
        let start = MFT_LCN as usize * CLUSTER + number * 1024;
        image[start..start + 1024].copy_from_slice(record);
    }

    #[test]
    fn mft_run_past_volume_end_is_corrupt() {
        let mut image = sample_volume(1);
        // one run of 2^52 clusters
        let runs = [0x18, 0, 0, 0, 0, 0, 0, 0x10, 0, MFT_LCN as u8];
        let record = RecordBuilder::new(0)
            .attribute(nonresident_attribute(DATA, 0, 1, 8 * 1024, 0, &runs))
            .build();
        replace_record(&mut image, 0, &record);

        let Err(err) = NtfsVolume::open(MemoryReader::new(image), &ScanContext::new()) else {
            panic!("a run past the volume end was accepted");
        };
        assert!(err.is_corruption());
    }

    #[test]
    fn oversized_sparse_run_is_corrupt() {
        let ctx = ScanContext::new();
        let mut volume = NtfsVolume::open(MemoryReader::new(sample_volume(1)), &ctx).unwrap();
        let runs = [DataRun {
            vcn_start: 0,
            length: 1 << 52,
            lcn: None,
        }];
        let mut buf = [0u8; 16];
        let err = volume.read_stream_range(&runs, 0, &mut buf).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn size_beyond_allocation_is_rejected_before_reading() {
        let ctx = ScanContext::new();
        let mut image = sample_volume(1);
        let attr = nonresident_attribute(DATA, 0, 15, 1 << 46, 4, &[0x11, 0x01, 30, 0x01, 0x0F]);
        replace_record(&mut image, 4, &RecordBuilder::new(4).attribute(attr).build());
        let plain = nonresident_attribute(DATA, 0, 1, 1 << 46, 0, &[0x11, 0x02, 20]);
        replace_record(&mut image, 3, &RecordBuilder::new(3).attribute(plain).build());

        let mut volume = NtfsVolume::open(MemoryReader::new(image), &ctx).unwrap();
        let mut cache = RecordCache::new();
        for number in [3, 4] {
            volume.load_into_cache(&mut cache, number).unwrap();
            let err = volume.read_attribute_data(&ctx, &cache, number, DATA, "").unwrap_err();
            assert!(err.is_corruption(), "record {}: {}", number, err);
        }
    }

    #[test]
    fn sparse_tail_of_compressed_stream_is_not_walked() {
        let ctx = ScanContext::new();
        let mut image = sample_volume(1);
        // one compressed cluster, 15 sparse, then 2^24 more sparse clusters
        let runs = [0x11, 0x01, 30, 0x01, 0x0F, 0x04, 0x00, 0x00, 0x00, 0x01];
        let attr = nonresident_attribute(DATA, 0, 16 + (1 << 24) - 1, 4096, 4, &runs);
        replace_record(&mut image, 4, &RecordBuilder::new(4).attribute(attr).build());
        image[30 * CLUSTER..30 * CLUSTER + 6].copy_from_slice(&[0x03, 0xB0, 0x00, b'a', b'b', b'c']);

        let mut volume = NtfsVolume::open(MemoryReader::new(image), &ctx).unwrap();
        let mut cache = RecordCache::new();
        volume.load_into_cache(&mut cache, 4).unwrap();
        let data = volume.read_attribute_data(&ctx, &cache, 4, DATA, "").unwrap();
        assert_eq!(data.len(), 4096);
        assert_eq!(&data[..3], b"abc");
    }

    #[test]
    fn expands_wof_compressed_file() {
        let ctx = ScanContext::new();
        let mut image = sample_volume(1);
        let (stream, expected) = sample_stream();
        image[30 * CLUSTER..30 * CLUSTER + stream.len()].copy_from_slice(&stream);

        let mut reparse = IO_REPARSE_TAG_WOF.to_le_bytes().to_vec();
        reparse.extend_from_slice(&[16, 0, 0, 0]);
        for field in [1u32, 2, 1, 0] {
            reparse.extend_from_slice(&field.to_le_bytes());
        }
        let record = RecordBuilder::new(4)
            // the unnamed stream is sparse, it only carries the logical size
            .attribute(nonresident_attribute(DATA, 0, 2, expected.len() as u64, 0, &[0x01, 0x03]))
            .attribute(named(
                nonresident_attribute(DATA, 0, 1, stream.len() as u64, 0, &[0x11, 0x02, 30]),
                WOF_STREAM_NAME,
            ))
            .attribute(resident_attribute(REPARSE_POINT, 2, &reparse))
            .build();
        replace_record(&mut image, 4, &record);

        let mut volume = NtfsVolume::open(MemoryReader::new(image), &ctx).unwrap();
        let mut cache = RecordCache::new();
        volume.load_into_cache(&mut cache, 4).unwrap();
        assert_eq!(cache.get(4).and_then(MftRecord::wof_algorithm), Some(WofAlgorithm::Xpress4k));
        assert_eq!(volume.read_file_data(&ctx, &cache, 4).unwrap(), expected);

        // without a WOF reparse point the unnamed stream is read as is
        volume.load_into_cache(&mut cache, 6).unwrap();
        let plain = volume.read_file_data(&ctx, &cache, 6).unwrap();
        assert_eq!(plain, volume.read_attribute_data(&ctx, &cache, 6, DATA, "").unwrap());
    }
}
