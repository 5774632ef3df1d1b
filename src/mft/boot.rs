use byteorder::{ByteOrder, LittleEndian};

use crate::error::{ForgeError, Result};

pub const NTFS_OEM_ID: &[u8; 8] = b"NTFS    ";

/// 2 MiB, the largest cluster NTFS formats.
const MAX_CLUSTER_SIZE: u64 = 0x20_0000;
const MAX_CLUSTER_SHIFT: u32 = 12;

#[derive(Debug, Clone)]
pub struct NtfsBootSector {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub total_sectors: u64,
    pub mft_lcn: u64,
    pub mft_mirror_lcn: u64,
    pub clusters_per_file_record_segment: i8,
    pub clusters_per_index_buffer: i8,
    pub volume_serial_number: u64,
}

impl NtfsBootSector {
    pub fn parse(vbr: &[u8]) -> Option<Self> {
        if vbr.len() < 512 || &vbr[3..11] != NTFS_OEM_ID {
            return None;
        }

        Some(Self {
            bytes_per_sector: LittleEndian::read_u16(&vbr[11..13]),
            sectors_per_cluster: vbr[13],
            total_sectors: LittleEndian::read_u64(&vbr[40..48]),
            mft_lcn: LittleEndian::read_u64(&vbr[48..56]),
            mft_mirror_lcn: LittleEndian::read_u64(&vbr[56..64]),
            clusters_per_file_record_segment: vbr[64] as i8,
            clusters_per_index_buffer: vbr[68] as i8,
            volume_serial_number: LittleEndian::read_u64(&vbr[72..80]),
        })
    }

    /// Values above 0x80 encode 2^(256 - v) sectors, used for clusters of 128 KiB
    /// and more.
    pub fn sectors_per_cluster_count(&self) -> Option<u64> {
        match self.sectors_per_cluster {
            0 => None,
            v @ 1..=0x80 => v.is_power_of_two().then_some(u64::from(v)),
            v => {
                let shift = 256 - u32::from(v);
                (shift <= MAX_CLUSTER_SHIFT).then(|| 1u64 << shift)
            }
        }
    }

    /// Zero when the encoded cluster size is invalid; `validate` rejects that.
    pub fn bytes_per_cluster(&self) -> u64 {
        self.bytes_per_sector as u64 * self.sectors_per_cluster_count().unwrap_or(0)
    }

    pub fn cluster_count(&self) -> u64 {
        match self.sectors_per_cluster_count() {
            Some(sectors) => self.total_sectors / sectors,
            None => 0,
        }
    }

    /// Positive values count clusters, negative ones are a power-of-two byte size.
    pub fn file_record_size_bytes(&self) -> Option<u32> {
        let v = self.clusters_per_file_record_segment;
        if v > 0 {
            u32::try_from(self.bytes_per_cluster())
                .ok()?
                .checked_mul(v as u32)
        } else if v < 0 {
            let pow = -(v as i32) as u32;
            if pow > 31 {
                None
            } else {
                Some(1u32 << pow)
            }
        } else {
            None
        }
    }

    /// Rejects geometry no NTFS driver would mount; returns the record size.
    pub fn validate(&self) -> Result<usize> {
        let bps = self.bytes_per_sector;
        if !matches!(bps, 512 | 1024 | 2048 | 4096) {
            return Err(ForgeError::corrupt("boot sector", format!("bytes per sector {}", bps)));
        }
        if self.sectors_per_cluster_count().is_none() || self.bytes_per_cluster() > MAX_CLUSTER_SIZE {
            return Err(ForgeError::corrupt(
                "boot sector",
                format!("sectors per cluster {:#04x}", self.sectors_per_cluster),
            ));
        }
        if self.mft_lcn == 0 {
            return Err(ForgeError::corrupt("boot sector", "$MFT starts at cluster 0"));
        }
        let size = self
            .file_record_size_bytes()
            .ok_or_else(|| ForgeError::corrupt("boot sector", "unknown file record size"))?
            as usize;
        if size < 1024 || !size.is_power_of_two() || size % bps as usize != 0 {
            return Err(ForgeError::corrupt("boot sector", format!("file record size {}", size)));
        }
        Ok(size)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A minimal NTFS boot sector: 512 bytes per sector, 8 sectors per cluster,
    /// 1 KiB records.
    pub(crate) fn sample_vbr(mft_lcn: u64, total_sectors: u64, serial: u64) -> Vec<u8> {
        let mut vbr = vec![0u8; 512];
        vbr[0..3].copy_from_slice(&[0xEB, 0x52, 0x90]);
        vbr[3..11].copy_from_slice(NTFS_OEM_ID);
        LittleEndian::write_u16(&mut vbr[11..13], 512);
        vbr[13] = 8;
        LittleEndian::write_u64(&mut vbr[40..48], total_sectors);
        LittleEndian::write_u64(&mut vbr[48..56], mft_lcn);
        LittleEndian::write_u64(&mut vbr[56..64], 2);
        vbr[64] = 0xF6; // -10
        vbr[68] = 1;
        LittleEndian::write_u64(&mut vbr[72..80], serial);
        vbr[510] = 0x55;
        vbr[511] = 0xAA;
        vbr
    }

    #[test]
    fn parses_geometry() {
        let boot = NtfsBootSector::parse(&sample_vbr(4, 2048, 0x1122_3344_5566_7788)).unwrap();
        assert_eq!(boot.bytes_per_cluster(), 4096);
        assert_eq!(boot.file_record_size_bytes(), Some(1024));
        assert_eq!(boot.validate().unwrap(), 1024);
        assert_eq!(boot.volume_serial_number, 0x1122_3344_5566_7788);
    }

    #[test]
    fn large_clusters_use_negative_exponent() {
        let mut vbr = sample_vbr(4, 0x10_0000, 1);
        vbr[13] = 0xF8; // 2^8 sectors
        let boot = NtfsBootSector::parse(&vbr).unwrap();
        assert_eq!(boot.bytes_per_cluster(), 128 * 1024);
        assert_eq!(boot.cluster_count(), 0x10_0000 / 256);
        assert_eq!(boot.validate().unwrap(), 1024);

        vbr[13] = 0xF4; // 2 MiB
        assert_eq!(NtfsBootSector::parse(&vbr).unwrap().bytes_per_cluster(), 0x20_0000);
        vbr[13] = 0xF3;
        assert!(NtfsBootSector::parse(&vbr).unwrap().validate().is_err());
    }

    #[test]
    fn rejects_bad_geometry() {
        let mut vbr = sample_vbr(4, 2048, 1);
        vbr[13] = 3;
        assert!(NtfsBootSector::parse(&vbr).unwrap().validate().is_err());
        let mut vbr = sample_vbr(4, 2048, 1);
        vbr[3] = b'X';
        assert!(NtfsBootSector::parse(&vbr).is_none());
    }
}
