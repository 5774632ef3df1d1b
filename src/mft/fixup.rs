use byteorder::{ByteOrder, LittleEndian};

use crate::error::{ForgeError, Result};

/// Restores the sector tails of a multi-sector structure (FILE/INDX records).
///
/// The update-sequence array at `usa_offset` holds the sequence number followed by
/// one saved word per sector. Every sector must end with the sequence number; any
/// mismatch rejects the whole buffer and leaves it untouched.
pub fn apply_fixups(data: &mut [u8], usa_offset: usize, usa_count: usize, bytes_per_sector: usize) -> Result<()> {
    if bytes_per_sector < 2 || data.len() % bytes_per_sector != 0 {
        return Err(ForgeError::corrupt(
            "fixup",
            format!("record length {} is not a multiple of {}", data.len(), bytes_per_sector),
        ));
    }
    let sectors = data.len() / bytes_per_sector;
    if usa_count != sectors + 1 {
        return Err(ForgeError::corrupt(
            "fixup",
            format!("update sequence holds {} entries for {} sectors", usa_count, sectors),
        ));
    }
    let usa_end = usa_offset.checked_add(usa_count * 2);
    if usa_end.map_or(true, |end| end > bytes_per_sector - 2) {
        return Err(ForgeError::corrupt("fixup", "update sequence array outside the first sector"));
    }

    let usn = LittleEndian::read_u16(&data[usa_offset..usa_offset + 2]);

    for sector in 1..=sectors {
        let tail = sector * bytes_per_sector - 2;
        let found = LittleEndian::read_u16(&data[tail..tail + 2]);
        if found != usn {
            return Err(ForgeError::FixupMismatch {
                sector: sector - 1,
                expected: usn,
                found,
            });
        }
    }

    for sector in 1..=sectors {
        let tail = sector * bytes_per_sector - 2;
        let saved = usa_offset + sector * 2;
        let (head, rest) = data.split_at_mut(tail);
        rest[..2].copy_from_slice(&head[saved..saved + 2]);
    }
    Ok(())
}
