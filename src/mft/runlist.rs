use crate::error::{ForgeError, Result};

/// One mapping pair of a nonresident attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRun {
    pub vcn_start: u64,
    pub length: u64,
    /// `None` for a sparse run.
    pub lcn: Option<u64>,
}

impl DataRun {
    pub fn is_sparse(&self) -> bool {
        self.lcn.is_none()
    }

    pub fn vcn_end(&self) -> u64 {
        self.vcn_start.saturating_add(self.length)
    }
}

/// Decodes mapping pairs starting at `start_vcn` until the zero terminator or the
/// end of `bytes`.
pub fn parse_data_runs(bytes: &[u8], start_vcn: u64) -> Result<Vec<DataRun>> {
    let mut runs = Vec::new();
    let mut pos = 0usize;
    let mut vcn = start_vcn;
    let mut lcn: i64 = 0;

    while pos < bytes.len() {
        let header = bytes[pos];
        if header == 0 {
            break;
        }
        pos += 1;

        let len_bytes = (header & 0x0F) as usize;
        let off_bytes = (header >> 4) as usize;
        if len_bytes == 0 || len_bytes > 8 || off_bytes > 8 {
            return Err(ForgeError::corrupt(
                "run list",
                format!("invalid header byte {:#04x} at {}", header, pos - 1),
            ));
        }
        if pos + len_bytes + off_bytes > bytes.len() {
            return Err(ForgeError::corrupt("run list", "mapping pair crosses the attribute end"));
        }

        let length = read_unsigned(&bytes[pos..pos + len_bytes]);
        pos += len_bytes;
        if length == 0 {
            return Err(ForgeError::corrupt("run list", format!("zero length run at vcn {:#x}", vcn)));
        }

        let run_lcn = if off_bytes == 0 {
            None
        } else {
            let delta = read_signed(&bytes[pos..pos + off_bytes]);
            pos += off_bytes;
            lcn = lcn
                .checked_add(delta)
                .ok_or_else(|| ForgeError::corrupt("run list", "lcn overflow"))?;
            if lcn < 0 {
                return Err(ForgeError::corrupt("run list", format!("negative lcn {}", lcn)));
            }
            Some(lcn as u64)
        };

        runs.push(DataRun {
            vcn_start: vcn,
            length,
            lcn: run_lcn,
        });
        vcn = vcn
            .checked_add(length)
            .ok_or_else(|| ForgeError::corrupt("run list", "vcn overflow"))?;
    }
    Ok(runs)
}

fn read_unsigned(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .enumerate()
        .fold(0u64, |acc, (i, b)| acc | ((*b as u64) << (i * 8)))
}

fn read_signed(bytes: &[u8]) -> i64 {
    let raw = read_unsigned(bytes);
    let bits = bytes.len() * 8;
    if bits < 64 && bytes[bytes.len() - 1] & 0x80 != 0 {
        (raw | (u64::MAX << bits)) as i64
    } else {
        raw as i64
    }
}

/// Translates a VCN into the run holding it and the LCN, `None` inside a sparse run.
pub fn lookup_vcn(runs: &[DataRun], vcn: u64) -> Option<(&DataRun, Option<u64>)> {
    runs.iter()
        .find(|r| vcn >= r.vcn_start && vcn < r.vcn_end())
        .map(|r| (r, r.lcn.map(|lcn| lcn + (vcn - r.vcn_start))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_run() {
        let runs = parse_data_runs(&[0x21, 0x18, 0x34, 0x56, 0x00], 0).unwrap();
        assert_eq!(
            runs,
            vec![DataRun {
                vcn_start: 0,
                length: 0x18,
                lcn: Some(0x5634)
            }]
        );
    }

    #[test]
    fn negative_relative_offset() {
        // +0x1000 then -0x10
        let bytes = [0x21, 0x04, 0x00, 0x10, 0x11, 0x02, 0xF0, 0x00];
        let runs = parse_data_runs(&bytes, 0).unwrap();
        assert_eq!(runs[0].lcn, Some(0x1000));
        assert_eq!(runs[1].lcn, Some(0x0FF0));
        assert_eq!(runs[1].vcn_start, 4);
    }

    #[test]
    fn sparse_run_has_no_lcn() {
        let runs = parse_data_runs(&[0x11, 0x10, 0x20, 0x01, 0x07, 0x00], 0x30).unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs[1].is_sparse());
        assert_eq!(runs[1].vcn_start, 0x40);
        assert_eq!(lookup_vcn(&runs, 0x31).unwrap().1, Some(0x21));
        assert_eq!(lookup_vcn(&runs, 0x42).unwrap().1, None);
        assert!(lookup_vcn(&runs, 0x47).is_none());
    }

    #[test]
    fn rejects_malformed_pairs() {
        assert!(parse_data_runs(&[0x09, 0x01], 0).is_err());
        assert!(parse_data_runs(&[0x10, 0x01], 0).is_err());
        assert!(parse_data_runs(&[0x21, 0x01], 0).is_err());
        // relative offset below cluster 0
        assert!(parse_data_runs(&[0x11, 0x01, 0xFF, 0x00], 0).is_err());
    }
}
