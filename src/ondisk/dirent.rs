//! Directory entries: `{inode, rec_len, name_len, file_type, name[]}`.

use crate::ondisk::constants::FileType;

/// Fixed header portion of every directory entry.
const HEADER_SIZE: usize = 8;

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub inode: u32,
    pub name: Vec<u8>,
    pub file_type: FileType,
}

impl DirEntry {
    /// The on-disk `rec_len` this entry would occupy if packed tightly
    /// (4-byte aligned), before any block-filling extension.
    pub fn packed_len(&self) -> u16 {
        let raw = HEADER_SIZE + self.name.len();
        crate::util::align_up(raw as u64, 4) as u16
    }

    /// Writes the entry at `buf[..]`, using `rec_len` as the entry's stride
    /// (which may be larger than `packed_len()` when this is the last entry
    /// in a block and must cover the remainder).
    pub fn write(&self, buf: &mut [u8], rec_len: u16) {
        buf[0..4].copy_from_slice(&self.inode.to_le_bytes());
        buf[4..6].copy_from_slice(&rec_len.to_le_bytes());
        buf[6] = self.name.len() as u8;
        buf[7] = self.file_type as u8;
        buf[HEADER_SIZE..HEADER_SIZE + self.name.len()].copy_from_slice(&self.name);
    }

    /// The trailing sentinel entry that terminates a directory block:
    /// `inode=0`, `rec_len` covering the unused remainder.
    pub fn write_terminator(buf: &mut [u8], rec_len: u16) {
        buf[0..4].copy_from_slice(&0u32.to_le_bytes());
        buf[4..6].copy_from_slice(&rec_len.to_le_bytes());
        buf[6] = 0;
        buf[7] = 0;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn packed_len_is_4_byte_aligned() {
        let e = DirEntry {
            inode: 11,
            name: b"a".to_vec(),
            file_type: FileType::RegularFile,
        };
        assert_eq!(e.packed_len() % 4, 0);
        assert_eq!(e.packed_len(), 12); // 8 + 1 rounded up to 12
    }

    #[test]
    fn write_round_trip() {
        let e = DirEntry {
            inode: 42,
            name: b"hello".to_vec(),
            file_type: FileType::RegularFile,
        };
        let mut buf = [0u8; 16];
        e.write(&mut buf, 16);
        assert_eq!(u32::from_le_bytes(buf[0..4].try_into().unwrap()), 42);
        assert_eq!(u16::from_le_bytes(buf[4..6].try_into().unwrap()), 16);
        assert_eq!(buf[6], 5);
        assert_eq!(buf[7], FileType::RegularFile as u8);
        assert_eq!(&buf[8..13], b"hello");
    }

    #[test]
    fn terminator_has_zero_inode() {
        let mut buf = [0xffu8; 16];
        DirEntry::write_terminator(&mut buf, 16);
        assert_eq!(u32::from_le_bytes(buf[0..4].try_into().unwrap()), 0);
        assert_eq!(u16::from_le_bytes(buf[4..6].try_into().unwrap()), 16);
    }
}
