//! MBR, EBR and GPT decoding.
//!
//! Entries that fail validation are kept as invalid partitions with the reason
//! attached, next to their siblings. A broken table is still evidence.

use std::collections::HashSet;
use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;
use uuid::Uuid;

use super::fs_type::{identify_boot_sector, BootSectorInfo, FileSystemType};
use crate::context::ScanContext;
use crate::error::{ForgeError, Result};
use crate::io::SectorReader;
use crate::mft::utils::{decode_utf16le, read_guid};

const MBR_ENTRIES_OFFSET: usize = 446;
const MBR_ENTRY_SIZE: usize = 16;
const MAX_EBR_LINKS: usize = 128;

const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
const GPT_MIN_HEADER_SIZE: usize = 92;
const GPT_MAX_ENTRIES: u32 = 4096;

const EFI_SYSTEM_GUID: Uuid = Uuid::from_u128(0xC12A7328_F81F_11D2_BA4B_00A0C93EC93B);
const MICROSOFT_RESERVED_GUID: Uuid = Uuid::from_u128(0xE3C9E316_0B5C_4DB8_817D_F92DF00215AE);
const BASIC_DATA_GUID: Uuid = Uuid::from_u128(0xEBD0A0A2_B9E5_4433_87C0_68B6B72699C7);
const RECOVERY_GUID: Uuid = Uuid::from_u128(0xDE94BBA4_06D1_4D40_A16A_BFD50179D6AC);
const LDM_METADATA_GUID: Uuid = Uuid::from_u128(0x5808C8AA_7E8F_42E0_85D2_E1E90434CFB3);
const LDM_DATA_GUID: Uuid = Uuid::from_u128(0xAF9B60A0_1431_4F62_BC68_3311714A69AD);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(transparent)]
pub struct PartitionFlags(u32);

impl PartitionFlags {
    pub const BOOTABLE: u32 = 0x01;
    pub const SYSTEM: u32 = 0x02;
    pub const HIDDEN: u32 = 0x04;
    pub const READ_ONLY: u32 = 0x08;
    pub const NO_AUTOMOUNT: u32 = 0x10;

    const NAMES: [(u32, &'static str); 5] = [
        (Self::BOOTABLE, "bootable"),
        (Self::SYSTEM, "system"),
        (Self::HIDDEN, "hidden"),
        (Self::READ_ONLY, "read-only"),
        (Self::NO_AUTOMOUNT, "no-automount"),
    ];

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, flag: u32) -> bool {
        self.0 & flag == flag
    }

    pub fn with(self, flag: u32) -> Self {
        Self(self.0 | flag)
    }

    /// GPT attribute bits: 0 system, 2 legacy bootable, 60 read-only, 62 hidden,
    /// 63 no-automount.
    pub fn from_gpt_attributes(attributes: u64) -> Self {
        let mut flags = Self::default();
        let mapping = [
            (0, Self::SYSTEM),
            (2, Self::BOOTABLE),
            (60, Self::READ_ONLY),
            (62, Self::HIDDEN),
            (63, Self::NO_AUTOMOUNT),
        ];
        for (bit, flag) in mapping {
            if attributes & (1u64 << bit) != 0 {
                flags = flags.with(flag);
            }
        }
        flags
    }

    pub fn names(self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl fmt::Display for PartitionFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = self.names();
        if names.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&names.join("|"))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PartitionType {
    Ntfs,
    Fat12,
    Fat16,
    Fat32,
    Refs,
    BitLocker,
    /// MBR type 0x07: NTFS, exFAT or ReFS until the boot sector says which.
    Ifs,
    Extended,
    GptProtective,
    EfiSystem,
    MicrosoftReserved,
    BasicData,
    Recovery,
    LdmMetadata,
    LdmData,
    Other,
}

impl PartitionType {
    /// Type byte of an MBR entry, with the hidden variants folded onto their base type.
    pub fn from_mbr_type(kind: u8) -> Self {
        let kind = if is_hidden_mbr_type(kind) { kind & 0x0F } else { kind };
        match kind {
            0x01 => Self::Fat12,
            0x04 | 0x06 | 0x0E => Self::Fat16,
            0x0B | 0x0C => Self::Fat32,
            0x07 => Self::Ifs,
            0x05 | 0x0F | 0x85 => Self::Extended,
            0x27 => Self::Recovery,
            0x42 => Self::LdmData,
            0xEE => Self::GptProtective,
            0xEF => Self::EfiSystem,
            _ => Self::Other,
        }
    }

    pub fn from_gpt_type(type_guid: &Uuid) -> Self {
        let known = [
            (EFI_SYSTEM_GUID, Self::EfiSystem),
            (MICROSOFT_RESERVED_GUID, Self::MicrosoftReserved),
            (BASIC_DATA_GUID, Self::BasicData),
            (RECOVERY_GUID, Self::Recovery),
            (LDM_METADATA_GUID, Self::LdmMetadata),
            (LDM_DATA_GUID, Self::LdmData),
        ];
        known
            .iter()
            .find(|(guid, _)| guid == type_guid)
            .map_or(Self::Other, |(_, kind)| *kind)
    }

    pub fn from_file_system(fs_type: FileSystemType) -> Self {
        match fs_type {
            FileSystemType::Ntfs => Self::Ntfs,
            FileSystemType::Fat12 => Self::Fat12,
            FileSystemType::Fat16 => Self::Fat16,
            FileSystemType::Fat32 => Self::Fat32,
            FileSystemType::Refs => Self::Refs,
            FileSystemType::BitLocker => Self::BitLocker,
            FileSystemType::Unknown => Self::Other,
        }
    }

    pub fn is_container(self) -> bool {
        matches!(self, Self::Extended | Self::GptProtective)
    }

    /// Generic types are narrowed to what the boot sector actually holds.
    fn refine(self, fs_type: FileSystemType) -> Self {
        match (self, fs_type) {
            (_, FileSystemType::Unknown) => self,
            (Self::Ifs | Self::BasicData | Self::Other, fs) => Self::from_file_system(fs),
            _ => self,
        }
    }
}

impl fmt::Display for PartitionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ntfs => "NTFS",
            Self::Fat12 => "FAT12",
            Self::Fat16 => "FAT16",
            Self::Fat32 => "FAT32",
            Self::Refs => "ReFS",
            Self::BitLocker => "BitLocker",
            Self::Ifs => "IFS",
            Self::Extended => "Extended",
            Self::GptProtective => "GPT protective",
            Self::EfiSystem => "EFI system",
            Self::MicrosoftReserved => "Microsoft reserved",
            Self::BasicData => "Basic data",
            Self::Recovery => "Recovery",
            Self::LdmMetadata => "LDM metadata",
            Self::LdmData => "LDM data",
            Self::Other => "Other",
        };
        f.write_str(name)
    }
}

fn is_hidden_mbr_type(kind: u8) -> bool {
    matches!(kind, 0x11 | 0x14 | 0x16 | 0x17 | 0x1B | 0x1C | 0x1E)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GptEntryInfo {
    pub type_guid: Uuid,
    pub unique_guid: Uuid,
    pub name: String,
    pub attributes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    number: u32,
    partition_type: PartitionType,
    flags: PartitionFlags,
    start: Option<u64>,
    end: Option<u64>,
    boot: BootSectorInfo,
    mbr_type: Option<u8>,
    gpt: Option<GptEntryInfo>,
    error: Option<String>,
}

impl Partition {
    /// A partition covering `start..=end`. `start > end` yields an invalid entry.
    pub fn from_extent(
        number: u32,
        partition_type: PartitionType,
        flags: PartitionFlags,
        start: u64,
        end: u64,
    ) -> Self {
        if start > end {
            return Self::invalid(
                number,
                partition_type,
                flags,
                format!("start {:#x} after end {:#x}", start, end),
            );
        }
        Self {
            number,
            partition_type,
            flags,
            start: Some(start),
            end: Some(end),
            boot: BootSectorInfo::UNKNOWN,
            mbr_type: None,
            gpt: None,
            error: None,
        }
    }

    pub fn invalid(
        number: u32,
        partition_type: PartitionType,
        flags: PartitionFlags,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            number,
            partition_type,
            flags,
            start: None,
            end: None,
            boot: BootSectorInfo::UNKNOWN,
            mbr_type: None,
            gpt: None,
            error: Some(reason.into()),
        }
    }

    fn with_mbr_type(mut self, kind: u8) -> Self {
        self.mbr_type = Some(kind);
        self
    }

    fn with_gpt(mut self, info: GptEntryInfo) -> Self {
        self.gpt = Some(info);
        self
    }

    fn with_boot_sector(mut self, boot: BootSectorInfo) -> Self {
        self.partition_type = self.partition_type.refine(boot.fs_type);
        self.boot = boot;
        self
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn partition_type(&self) -> PartitionType {
        self.partition_type
    }

    pub fn flags(&self) -> PartitionFlags {
        self.flags
    }

    pub fn start(&self) -> Option<u64> {
        self.start
    }

    pub fn end(&self) -> Option<u64> {
        self.end
    }

    pub fn size(&self) -> Option<u64> {
        Some(self.end? - self.start? + 1)
    }

    pub fn is_valid(&self) -> bool {
        self.start.is_some() && self.end.is_some() && self.error.is_none()
    }

    pub fn file_system(&self) -> FileSystemType {
        self.boot.fs_type
    }

    pub fn serial_number(&self) -> u64 {
        self.boot.serial_number
    }

    pub fn mbr_type(&self) -> Option<u8> {
        self.mbr_type
    }

    pub fn gpt(&self) -> Option<&GptEntryInfo> {
        self.gpt.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Partition {}: {} [{}]", self.number, self.partition_type, self.flags)?;
        match (self.start, self.end, self.size()) {
            (Some(start), Some(end), Some(size)) if self.error.is_none() => {
                write!(f, " {:#x}-{:#x} ({} bytes)", start, end, size)?;
                if self.boot.fs_type.is_known() {
                    write!(f, " {}", self.boot.fs_type)?;
                }
                Ok(())
            }
            _ => write!(f, " Invalid ({})", self.error.as_deref().unwrap_or("no extent")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TableKind {
    Mbr,
    Gpt,
    /// Sector 0 is a volume boot record; the whole device is one volume.
    Volume,
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Mbr => "MBR",
            Self::Gpt => "GPT",
            Self::Volume => "Volume",
        })
    }
}

#[derive(Debug, Clone)]
pub struct PartitionTable {
    kind: TableKind,
    sector_size: u32,
    disk_guid: Option<Uuid>,
    partitions: Vec<Partition>,
    warnings: Vec<String>,
}

/// Byte extent of `first_lba..=last_lba`, checked against the device.
fn lba_extent(first_lba: u64, last_lba: u64, sector_size: u64, device_len: u64) -> std::result::Result<(u64, u64), String> {
    if first_lba > last_lba {
        return Err(format!("first LBA {} after last LBA {}", first_lba, last_lba));
    }
    let start = first_lba
        .checked_mul(sector_size)
        .ok_or_else(|| format!("LBA {} overflows", first_lba))?;
    let end = last_lba
        .checked_add(1)
        .and_then(|n| n.checked_mul(sector_size))
        .map(|n| n - 1)
        .ok_or_else(|| format!("LBA {} overflows", last_lba))?;
    if end >= device_len {
        return Err(format!(
            "extent {:#x}-{:#x} outside device of {:#x} bytes",
            start, end, device_len
        ));
    }
    Ok((start, end))
}

fn mbr_entry(sector: &[u8], index: usize) -> &[u8] {
    let offset = MBR_ENTRIES_OFFSET + index * MBR_ENTRY_SIZE;
    &sector[offset..offset + MBR_ENTRY_SIZE]
}

fn has_boot_signature(sector: &[u8]) -> bool {
    sector.len() >= 512 && sector[510] == 0x55 && sector[511] == 0xAA
}

struct GptHeader {
    alternate_lba: u64,
    disk_guid: Option<Uuid>,
    entries_lba: u64,
    entry_count: u32,
    entry_size: u32,
    entries_crc: u32,
}

impl GptHeader {
    fn parse(sector: &[u8]) -> Result<Self> {
        if sector.len() < GPT_MIN_HEADER_SIZE || &sector[0..8] != GPT_SIGNATURE {
            return Err(ForgeError::corrupt("gpt header", "missing EFI PART signature"));
        }
        let header_size = LittleEndian::read_u32(&sector[12..16]) as usize;
        if header_size < GPT_MIN_HEADER_SIZE || header_size > sector.len() {
            return Err(ForgeError::corrupt(
                "gpt header",
                format!("header size {}", header_size),
            ));
        }
        let stored_crc = LittleEndian::read_u32(&sector[16..20]);
        let mut header = sector[..header_size].to_vec();
        header[16..20].fill(0);
        let computed_crc = crc32fast::hash(&header);
        if computed_crc != stored_crc {
            return Err(ForgeError::corrupt(
                "gpt header",
                format!("crc {:#010x} != stored {:#010x}", computed_crc, stored_crc),
            ));
        }

        let entry_count = LittleEndian::read_u32(&sector[0x50..0x54]);
        let entry_size = LittleEndian::read_u32(&sector[0x54..0x58]);
        if !(128..=4096).contains(&entry_size) || entry_size % 8 != 0 || entry_count > GPT_MAX_ENTRIES {
            return Err(ForgeError::corrupt(
                "gpt header",
                format!("{} entries of {} bytes", entry_count, entry_size),
            ));
        }

        Ok(Self {
            alternate_lba: LittleEndian::read_u64(&sector[32..40]),
            disk_guid: read_guid(&sector[56..72]),
            entries_lba: LittleEndian::read_u64(&sector[0x48..0x50]),
            entry_count,
            entry_size,
            entries_crc: LittleEndian::read_u32(&sector[0x58..0x5C]),
        })
    }
}

impl PartitionTable {
    /// Decodes the partition table of a whole device.
    ///
    /// Only an unreadable sector 0, or a sector 0 that is neither a boot record nor
    /// a partition table, fails the call. Everything else is attached to the
    /// offending partition or collected as a warning.
    pub fn read<R: SectorReader + ?Sized>(reader: &mut R, ctx: &ScanContext) -> Result<Self> {
        ctx.check_cancelled()?;
        let sector_size = reader.sector_size().max(512);
        let device_len = reader.len();
        let sector0 = reader.read_sectors(0, sector_size as usize)?;

        let boot = identify_boot_sector(&sector0);
        if boot.fs_type.is_known() {
            ctx.debug(
                "partition table",
                format!("sector 0 is a {} boot record, treating device as one volume", boot.fs_type),
            );
            let partition = Partition::from_extent(
                1,
                PartitionType::from_file_system(boot.fs_type),
                PartitionFlags::default(),
                0,
                device_len.saturating_sub(1),
            )
            .with_boot_sector(boot);
            return Ok(Self {
                kind: TableKind::Volume,
                sector_size,
                disk_guid: None,
                partitions: vec![partition],
                warnings: Vec::new(),
            });
        }

        if !has_boot_signature(&sector0) {
            return Err(ForgeError::corrupt(
                "partition table",
                "sector 0 carries neither a boot record nor a partition table",
            ));
        }

        let mut table = Self {
            kind: TableKind::Mbr,
            sector_size,
            disk_guid: None,
            partitions: Vec::new(),
            warnings: Vec::new(),
        };

        let protective = (0..4).any(|i| mbr_entry(&sector0, i)[4] == 0xEE);
        let gpt_loaded = protective && table.load_gpt(reader, device_len, ctx);
        if !gpt_loaded {
            table.load_mbr(reader, &sector0, device_len, ctx);
        }

        table.detect_file_systems(reader, ctx)?;
        Ok(table)
    }

    fn warn(&mut self, ctx: &ScanContext, message: String) {
        ctx.warn("partition table", &message);
        self.warnings.push(message);
    }

    fn load_mbr<R: SectorReader + ?Sized>(&mut self, reader: &mut R, sector0: &[u8], device_len: u64, ctx: &ScanContext) {
        let sector_size = u64::from(self.sector_size);
        let mut next_logical = 5u32;

        for index in 0..4 {
            let entry = mbr_entry(sector0, index);
            let kind = entry[4];
            if kind == 0 {
                continue;
            }
            let number = index as u32 + 1;
            let partition = Self::decode_mbr_entry(number, entry, 0, sector_size, device_len);
            let is_extended = partition.is_valid() && partition.partition_type == PartitionType::Extended;
            self.partitions.push(partition);

            if is_extended {
                let base_lba = u64::from(LittleEndian::read_u32(&entry[8..12]));
                self.load_ebr_chain(reader, base_lba, device_len, &mut next_logical, ctx);
            }
        }
    }

    fn decode_mbr_entry(number: u32, entry: &[u8], base_lba: u64, sector_size: u64, device_len: u64) -> Partition {
        let kind = entry[4];
        let partition_type = PartitionType::from_mbr_type(kind);
        let mut flags = PartitionFlags::default();
        if is_hidden_mbr_type(kind) {
            flags = flags.with(PartitionFlags::HIDDEN);
        }
        match entry[0] {
            0x00 => {}
            0x80 => flags = flags.with(PartitionFlags::BOOTABLE),
            other => {
                return Partition::invalid(number, partition_type, flags, format!("boot indicator {:#04x}", other))
                    .with_mbr_type(kind)
            }
        }

        let relative_lba = u64::from(LittleEndian::read_u32(&entry[8..12]));
        let sectors = u64::from(LittleEndian::read_u32(&entry[12..16]));
        if sectors == 0 {
            return Partition::invalid(number, partition_type, flags, "zero sectors").with_mbr_type(kind);
        }
        let first_lba = base_lba + relative_lba;
        match lba_extent(first_lba, first_lba + sectors - 1, sector_size, device_len) {
            Ok((start, end)) => Partition::from_extent(number, partition_type, flags, start, end),
            Err(reason) => Partition::invalid(number, partition_type, flags, reason),
        }
        .with_mbr_type(kind)
    }

    fn load_ebr_chain<R: SectorReader + ?Sized>(
        &mut self,
        reader: &mut R,
        base_lba: u64,
        device_len: u64,
        next_logical: &mut u32,
        ctx: &ScanContext,
    ) {
        let sector_size = u64::from(self.sector_size);
        let mut ebr_lba = base_lba;
        let mut visited = HashSet::new();

        for _ in 0..MAX_EBR_LINKS {
            if !visited.insert(ebr_lba) {
                self.warn(ctx, format!("EBR chain loops back to LBA {}", ebr_lba));
                return;
            }
            let ebr = match ebr_lba
                .checked_mul(sector_size)
                .ok_or_else(|| ForgeError::corrupt("ebr", "LBA overflows"))
                .and_then(|offset| reader.read_sectors(offset, sector_size as usize))
            {
                Ok(ebr) => ebr,
                Err(err) => {
                    self.warn(ctx, format!("EBR at LBA {} unreadable: {}", ebr_lba, err));
                    return;
                }
            };
            if !has_boot_signature(&ebr) {
                self.warn(ctx, format!("EBR at LBA {} has no boot signature", ebr_lba));
                return;
            }

            let logical = mbr_entry(&ebr, 0);
            if logical[4] != 0 {
                let partition = Self::decode_mbr_entry(*next_logical, logical, ebr_lba, sector_size, device_len);
                *next_logical += 1;
                self.partitions.push(partition);
            }

            let link = mbr_entry(&ebr, 1);
            if link[4] == 0 {
                return;
            }
            ebr_lba = base_lba + u64::from(LittleEndian::read_u32(&link[8..12]));
        }
        self.warn(ctx, format!("EBR chain longer than {} links", MAX_EBR_LINKS));
    }

    fn read_gpt_header<R: SectorReader + ?Sized>(&mut self, reader: &mut R, last_lba: u64, ctx: &ScanContext) -> Result<GptHeader> {
        let sector_size = u64::from(self.sector_size);
        let primary = reader.read_sectors(sector_size, sector_size as usize)?;
        let primary_err = match GptHeader::parse(&primary) {
            Ok(header) => return Ok(header),
            Err(err) => err,
        };

        // a signed primary still says where its backup lives
        let mut alternate = if &primary[0..8] == GPT_SIGNATURE {
            LittleEndian::read_u64(&primary[32..40])
        } else {
            last_lba
        };
        if alternate == 0 || alternate > last_lba {
            alternate = last_lba;
        }
        self.warn(
            ctx,
            format!("primary GPT header rejected ({}), trying backup at LBA {}", primary_err, alternate),
        );
        let backup = reader.read_sectors(alternate * sector_size, sector_size as usize)?;
        GptHeader::parse(&backup)
    }

    /// Loads the GPT, falling back to the backup header. Returns false when
    /// neither header is usable, leaving the protective MBR to be decoded instead.
    fn load_gpt<R: SectorReader + ?Sized>(&mut self, reader: &mut R, device_len: u64, ctx: &ScanContext) -> bool {
        let sector_size = u64::from(self.sector_size);
        let last_lba = (device_len / sector_size).saturating_sub(1);

        let header = match self.read_gpt_header(reader, last_lba, ctx) {
            Ok(header) => header,
            Err(err) => {
                self.warn(ctx, format!("no usable GPT header: {}", err));
                return false;
            }
        };

        let array_len = header.entry_count as usize * header.entry_size as usize;
        let entries = match header
            .entries_lba
            .checked_mul(sector_size)
            .ok_or_else(|| ForgeError::corrupt("gpt entries", "LBA overflows"))
            .and_then(|offset| reader.read_sectors(offset, array_len))
        {
            Ok(entries) => entries,
            Err(err) => {
                self.warn(ctx, format!("GPT entry array unreadable: {}", err));
                return false;
            }
        };
        let entries_crc = crc32fast::hash(&entries);
        if entries_crc != header.entries_crc {
            self.warn(
                ctx,
                format!(
                    "GPT entry array crc {:#010x} != stored {:#010x}",
                    entries_crc, header.entries_crc
                ),
            );
        }

        self.kind = TableKind::Gpt;
        self.disk_guid = header.disk_guid;
        for (index, entry) in entries.chunks_exact(header.entry_size as usize).enumerate() {
            let Some(type_guid) = read_guid(&entry[0..16]) else {
                continue;
            };
            if type_guid.is_nil() {
                continue;
            }
            let number = index as u32 + 1;
            let attributes = LittleEndian::read_u64(&entry[0x30..0x38]);
            let name = decode_utf16le(&entry[0x38..0x80]).trim_end_matches('\0').to_string();
            let info = GptEntryInfo {
                type_guid,
                unique_guid: read_guid(&entry[16..32]).unwrap_or_default(),
                name,
                attributes,
            };
            let partition_type = PartitionType::from_gpt_type(&type_guid);
            let flags = PartitionFlags::from_gpt_attributes(attributes);
            let first_lba = LittleEndian::read_u64(&entry[0x20..0x28]);
            let last_lba = LittleEndian::read_u64(&entry[0x28..0x30]);
            let partition = match lba_extent(first_lba, last_lba, sector_size, device_len) {
                Ok((start, end)) => Partition::from_extent(number, partition_type, flags, start, end),
                Err(reason) => Partition::invalid(number, partition_type, flags, reason),
            };
            self.partitions.push(partition.with_gpt(info));
        }
        true
    }

    fn detect_file_systems<R: SectorReader + ?Sized>(&mut self, reader: &mut R, ctx: &ScanContext) -> Result<()> {
        let sector_size = self.sector_size as usize;
        for partition in &mut self.partitions {
            ctx.check_cancelled()?;
            if !partition.is_valid() || partition.partition_type.is_container() {
                continue;
            }
            let (Some(start), Some(size)) = (partition.start, partition.size()) else {
                continue;
            };
            if size < sector_size as u64 {
                continue;
            }
            match reader.read_sectors(start, sector_size) {
                Ok(sector) => {
                    let boot = identify_boot_sector(&sector);
                    *partition = partition.clone().with_boot_sector(boot);
                }
                Err(err) => {
                    let reason = format!("boot sector unreadable: {}", err);
                    ctx.warn("partition table", format!("partition {} {}", partition.number, reason));
                    partition.error = Some(reason);
                }
            }
        }
        Ok(())
    }

    pub fn kind(&self) -> TableKind {
        self.kind
    }

    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }

    pub fn disk_guid(&self) -> Option<Uuid> {
        self.disk_guid
    }

    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Valid partitions whose boot sector names a filesystem.
    pub fn volumes(&self) -> impl Iterator<Item = &Partition> {
        self.partitions
            .iter()
            .filter(|p| p.is_valid() && p.file_system().is_known())
    }

    /// Partitions with a decoded extent whose boot sector could not be read.
    pub fn unreadable(&self) -> impl Iterator<Item = &Partition> {
        self.partitions
            .iter()
            .filter(|p| p.start.is_some() && p.error.is_some())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::io::MemoryReader;
    use crate::location::fs_type::tests::fat32_vbr;
    use crate::mft::boot::tests::sample_vbr;

    pub(crate) fn set_mbr_entry(sector: &mut [u8], index: usize, boot: u8, kind: u8, lba: u32, sectors: u32) {
        let offset = MBR_ENTRIES_OFFSET + index * MBR_ENTRY_SIZE;
        sector[offset] = boot;
        sector[offset + 4] = kind;
        LittleEndian::write_u32(&mut sector[offset + 8..offset + 12], lba);
        LittleEndian::write_u32(&mut sector[offset + 12..offset + 16], sectors);
        sector[510] = 0x55;
        sector[511] = 0xAA;
    }

    fn place(disk: &mut [u8], lba: usize, bytes: &[u8]) {
        disk[lba * 512..lba * 512 + bytes.len()].copy_from_slice(bytes);
    }

    /// Fails every read touching `bad`.
    pub(crate) struct BadSectors {
        pub(crate) inner: MemoryReader,
        pub(crate) bad: std::ops::Range<u64>,
    }

    impl SectorReader for BadSectors {
        fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
            let end = offset + buf.len() as u64;
            if offset < self.bad.end && end > self.bad.start {
                return Err(ForgeError::Io(std::io::Error::new(std::io::ErrorKind::Other, "bad sector")));
            }
            self.inner.read_at(offset, buf)
        }

        fn len(&self) -> u64 {
            self.inner.len()
        }
    }

    #[test]
    fn unreadable_boot_sector_marks_its_partition() {
        let mut disk = vec![0u8; 8192 * 512];
        let mut mbr = vec![0u8; 512];
        set_mbr_entry(&mut mbr, 0, 0x80, 0x07, 2048, 2048);
        set_mbr_entry(&mut mbr, 1, 0x00, 0x07, 4096, 2048);
        place(&mut disk, 0, &mbr);
        place(&mut disk, 2048, &sample_vbr(4, 2047, 0xABCD));
        place(&mut disk, 4096, &sample_vbr(4, 2047, 0xDCBA));
        let mut reader = BadSectors {
            inner: MemoryReader::new(disk),
            bad: 4096 * 512..4097 * 512,
        };

        let table = PartitionTable::read(&mut reader, &ScanContext::new()).unwrap();
        let parts = table.partitions();
        assert!(parts[0].is_valid());
        assert_eq!(parts[0].file_system(), FileSystemType::Ntfs);

        assert!(!parts[1].is_valid());
        assert_eq!(parts[1].start(), Some(4096 * 512));
        assert!(parts[1].error().unwrap().contains("boot sector unreadable"));
        assert!(table.warnings().is_empty());
        assert_eq!(table.volumes().count(), 1);
        assert_eq!(table.unreadable().map(Partition::number).collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn extent_defines_size() {
        let p = Partition::from_extent(1, PartitionType::Ntfs, PartitionFlags::default(), 0x100000, 0x1FFFFF);
        assert!(p.is_valid());
        assert_eq!(p.size(), Some(0x100000));

        let p = Partition::from_extent(2, PartitionType::Ntfs, PartitionFlags::default(), 0x200000, 0x1FFFFF);
        assert!(!p.is_valid());
        assert_eq!(p.start(), None);
        assert_eq!(p.size(), None);
        assert!(p.to_string().contains("Invalid"));
    }

    #[test]
    fn mbr_keeps_bad_entries_next_to_good_ones() {
        let mut disk = vec![0u8; 8192 * 512];
        let mut mbr = vec![0u8; 512];
        set_mbr_entry(&mut mbr, 0, 0x80, 0x07, 2048, 2048);
        set_mbr_entry(&mut mbr, 1, 0x12, 0x07, 6000, 100);
        set_mbr_entry(&mut mbr, 2, 0x00, 0x07, 8000, 1000);
        set_mbr_entry(&mut mbr, 3, 0x00, 0x0C, 4096, 2048);
        place(&mut disk, 0, &mbr);
        place(&mut disk, 2048, &sample_vbr(4, 2047, 0xABCD));
        place(&mut disk, 4096, &fat32_vbr(0x1234));

        let table = PartitionTable::read(&mut MemoryReader::new(disk), &ScanContext::new()).unwrap();
        assert_eq!(table.kind(), TableKind::Mbr);
        let parts = table.partitions();
        assert_eq!(parts.len(), 4);

        assert!(parts[0].is_valid());
        assert_eq!(parts[0].start(), Some(0x100000));
        assert_eq!(parts[0].end(), Some(0x1FFFFF));
        assert_eq!(parts[0].size(), Some(0x100000));
        assert_eq!(parts[0].partition_type(), PartitionType::Ntfs);
        assert_eq!(parts[0].serial_number(), 0xABCD);
        assert!(parts[0].flags().contains(PartitionFlags::BOOTABLE));

        assert!(!parts[1].is_valid());
        assert!(parts[1].error().unwrap().contains("boot indicator"));
        assert!(!parts[2].is_valid());
        assert!(parts[2].error().unwrap().contains("outside device"));

        assert_eq!(parts[3].file_system(), FileSystemType::Fat32);
        assert_eq!(table.volumes().count(), 2);
    }

    #[test]
    fn follows_ebr_chain() {
        let mut disk = vec![0u8; 8192 * 512];
        let mut mbr = vec![0u8; 512];
        set_mbr_entry(&mut mbr, 0, 0, 0x0F, 2048, 4096);
        place(&mut disk, 0, &mbr);

        let mut ebr = vec![0u8; 512];
        set_mbr_entry(&mut ebr, 0, 0, 0x07, 63, 100);
        set_mbr_entry(&mut ebr, 1, 0, 0x05, 1000, 500);
        place(&mut disk, 2048, &ebr);
        let mut ebr = vec![0u8; 512];
        set_mbr_entry(&mut ebr, 0, 0, 0x0B, 63, 100);
        place(&mut disk, 3048, &ebr);
        place(&mut disk, 2048 + 63, &sample_vbr(4, 99, 9));

        let table = PartitionTable::read(&mut MemoryReader::new(disk), &ScanContext::new()).unwrap();
        let numbers: Vec<u32> = table.partitions().iter().map(|p| p.number()).collect();
        assert_eq!(numbers, vec![1, 5, 6]);
        assert_eq!(table.partitions()[1].start(), Some((2048 + 63) * 512));
        assert_eq!(table.partitions()[1].file_system(), FileSystemType::Ntfs);
        assert_eq!(table.partitions()[2].start(), Some((3048 + 63) * 512));
        assert!(table.warnings().is_empty());
    }

    fn gpt_header(my_lba: u64, alternate_lba: u64, entries_crc: u32) -> Vec<u8> {
        let mut header = vec![0u8; 512];
        header[0..8].copy_from_slice(GPT_SIGNATURE);
        LittleEndian::write_u32(&mut header[8..12], 0x0001_0000);
        LittleEndian::write_u32(&mut header[12..16], 92);
        LittleEndian::write_u64(&mut header[24..32], my_lba);
        LittleEndian::write_u64(&mut header[32..40], alternate_lba);
        LittleEndian::write_u64(&mut header[40..48], 34);
        LittleEndian::write_u64(&mut header[48..56], 4062);
        header[56..72].copy_from_slice(&[0x11; 16]);
        LittleEndian::write_u64(&mut header[0x48..0x50], 2);
        LittleEndian::write_u32(&mut header[0x50..0x54], 4);
        LittleEndian::write_u32(&mut header[0x54..0x58], 128);
        LittleEndian::write_u32(&mut header[0x58..0x5C], entries_crc);
        let crc = crc32fast::hash(&header[..92]);
        LittleEndian::write_u32(&mut header[16..20], crc);
        header
    }

    pub(crate) fn gpt_disk(corrupt_primary: bool) -> Vec<u8> {
        let mut disk = vec![0u8; 4096 * 512];
        let mut mbr = vec![0u8; 512];
        set_mbr_entry(&mut mbr, 0, 0, 0xEE, 1, 4095);
        place(&mut disk, 0, &mbr);

        let mut entries = vec![0u8; 512];
        entries[0..16].copy_from_slice(&BASIC_DATA_GUID.to_bytes_le());
        entries[16..32].copy_from_slice(&[0x22; 16]);
        LittleEndian::write_u64(&mut entries[0x20..0x28], 40);
        LittleEndian::write_u64(&mut entries[0x28..0x30], 40 + 2047);
        LittleEndian::write_u64(&mut entries[0x30..0x38], 1 << 63);
        for (i, unit) in "Data".encode_utf16().enumerate() {
            LittleEndian::write_u16(&mut entries[0x38 + i * 2..0x3A + i * 2], unit);
        }
        let entries_crc = crc32fast::hash(&entries);
        place(&mut disk, 2, &entries);

        let mut primary = gpt_header(1, 4095, entries_crc);
        if corrupt_primary {
            primary[60] ^= 0xFF;
        }
        place(&mut disk, 1, &primary);
        place(&mut disk, 4095, &gpt_header(4095, 1, entries_crc));
        place(&mut disk, 40, &sample_vbr(4, 2047, 0x5151));
        disk
    }

    #[test]
    fn decodes_gpt_entry() {
        let table = PartitionTable::read(&mut MemoryReader::new(gpt_disk(false)), &ScanContext::new()).unwrap();
        assert_eq!(table.kind(), TableKind::Gpt);
        assert!(table.warnings().is_empty());
        assert_eq!(table.partitions().len(), 1);

        let p = &table.partitions()[0];
        assert_eq!(p.start(), Some(40 * 512));
        assert_eq!(p.size(), Some(2048 * 512));
        assert_eq!(p.partition_type(), PartitionType::Ntfs);
        assert!(p.flags().contains(PartitionFlags::NO_AUTOMOUNT));
        let gpt = p.gpt().unwrap();
        assert_eq!(gpt.type_guid, BASIC_DATA_GUID);
        assert_eq!(gpt.name, "Data");
    }

    #[test]
    fn corrupt_primary_header_falls_back_to_backup() {
        let table = PartitionTable::read(&mut MemoryReader::new(gpt_disk(true)), &ScanContext::new()).unwrap();
        assert_eq!(table.kind(), TableKind::Gpt);
        assert_eq!(table.partitions().len(), 1);
        assert_eq!(table.partitions()[0].serial_number(), 0x5151);
        assert!(table.warnings().iter().any(|w| w.contains("primary GPT header rejected")));
    }

    #[test]
    fn whole_device_volume() {
        let mut disk = vec![0u8; 64 * 512];
        place(&mut disk, 0, &sample_vbr(4, 63, 3));
        let table = PartitionTable::read(&mut MemoryReader::new(disk), &ScanContext::new()).unwrap();
        assert_eq!(table.kind(), TableKind::Volume);
        assert_eq!(table.partitions()[0].size(), Some(64 * 512));
    }

    #[test]
    fn blank_sector_zero_is_corrupt() {
        let err = PartitionTable::read(&mut MemoryReader::new(vec![0u8; 4096]), &ScanContext::new()).unwrap_err();
        assert!(err.is_corruption());
    }
}
