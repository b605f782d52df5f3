//! The ext4 primary superblock (1024 bytes, written at disk offset 1024).
//!
//! Rather than relying on the host's native struct layout (`repr(C, packed)`
//! plus an unsafe reinterpret-cast, as the teacher's `mkfs` does for ext2),
//! we serialize explicit little-endian fields into a fixed byte buffer. This
//! keeps the representation correct regardless of host endianness and lets
//! each field be checked against a golden hex fixture in isolation.

use uuid::Uuid;

/// Total on-disk size of the superblock record.
pub const SIZE: usize = 1024;

/// Byte offset of `s_magic` within the superblock, per the spec.
pub const MAGIC_OFFSET: usize = 56;

#[derive(Debug, Clone)]
pub struct Superblock {
    pub inodes_count: u32,
    pub blocks_count_lo: u32,
    pub reserved_blocks_count_lo: u32,
    pub free_blocks_count_lo: u32,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    pub log_block_size: u32,
    pub log_cluster_size: u32,
    pub blocks_per_group: u32,
    pub clusters_per_group: u32,
    pub inodes_per_group: u32,
    pub mtime: u32,
    pub wtime: u32,
    pub mnt_count: u16,
    pub max_mnt_count: u16,
    pub state: u16,
    pub errors: u16,
    pub minor_rev_level: u16,
    pub lastcheck: u32,
    pub checkinterval: u32,
    pub creator_os: u32,
    pub rev_level: u32,
    pub def_resuid: u16,
    pub def_resgid: u16,
    pub first_ino: u32,
    pub inode_size: u16,
    pub block_group_nr: u16,
    pub feature_compat: u32,
    pub feature_incompat: u32,
    pub feature_ro_compat: u32,
    pub uuid: [u8; 16],
    pub volume_name: [u8; 16],
    pub last_mounted: [u8; 64],
    pub reserved_gdt_blocks: u16,
    pub desc_size: u16,
    pub default_mount_opts: u32,
    pub log_groups_per_flex: u8,
    pub checksum_type: u8,
}

impl Superblock {
    /// A superblock with every field zeroed except the ones unconditionally
    /// required: magic, revision level, a fresh random UUID, and the feature
    /// set from §4.1.3 step 7.
    pub fn new(block_size: u32, creator_os: u32) -> Self {
        Self {
            inodes_count: 0,
            blocks_count_lo: 0,
            reserved_blocks_count_lo: 0,
            free_blocks_count_lo: 0,
            free_inodes_count: 0,
            first_data_block: if block_size == 1024 { 1 } else { 0 },
            log_block_size: crate::util::log2(block_size as u64).unwrap_or(0) - 10,
            log_cluster_size: crate::util::log2(block_size as u64).unwrap_or(0) - 10,
            blocks_per_group: 0,
            clusters_per_group: 0,
            inodes_per_group: 0,
            mtime: 0,
            wtime: 0,
            mnt_count: 0,
            max_mnt_count: 0xFFFF,
            state: 1, // clean
            errors: 1, // continue
            minor_rev_level: 0,
            lastcheck: crate::util::now().0 as u32,
            checkinterval: 0,
            creator_os,
            rev_level: 1,
            def_resuid: 0,
            def_resgid: 0,
            first_ino: crate::ondisk::constants::FIRST_USER_INODE,
            inode_size: crate::ondisk::constants::INODE_SIZE,
            block_group_nr: 0,
            feature_compat: crate::ondisk::constants::feature_compat::SPARSE_SUPER2
                | crate::ondisk::constants::feature_compat::EXT_ATTR,
            feature_incompat: crate::ondisk::constants::feature_incompat::FILETYPE
                | crate::ondisk::constants::feature_incompat::EXTENTS
                | crate::ondisk::constants::feature_incompat::FLEX_BG
                | crate::ondisk::constants::feature_incompat::INLINE_DATA,
            feature_ro_compat: crate::ondisk::constants::feature_ro_compat::LARGE_FILE
                | crate::ondisk::constants::feature_ro_compat::HUGE_FILE
                | crate::ondisk::constants::feature_ro_compat::EXTRA_ISIZE,
            uuid: *Uuid::new_v4().as_bytes(),
            volume_name: [0; 16],
            last_mounted: [0; 64],
            reserved_gdt_blocks: 0,
            desc_size: crate::ondisk::constants::GROUP_DESC_SIZE as u16,
            default_mount_opts: 0,
            log_groups_per_flex: 31,
            checksum_type: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; SIZE] {
        let mut b = [0u8; SIZE];
        macro_rules! put32 {
            ($off:expr, $v:expr) => {
                b[$off..$off + 4].copy_from_slice(&($v as u32).to_le_bytes())
            };
        }
        macro_rules! put16 {
            ($off:expr, $v:expr) => {
                b[$off..$off + 2].copy_from_slice(&($v as u16).to_le_bytes())
            };
        }
        put32!(0x000, self.inodes_count);
        put32!(0x004, self.blocks_count_lo);
        put32!(0x008, self.reserved_blocks_count_lo);
        put32!(0x00C, self.free_blocks_count_lo);
        put32!(0x010, self.free_inodes_count);
        put32!(0x014, self.first_data_block);
        put32!(0x018, self.log_block_size);
        put32!(0x01C, self.log_cluster_size);
        put32!(0x020, self.blocks_per_group);
        put32!(0x024, self.clusters_per_group);
        put32!(0x028, self.inodes_per_group);
        put32!(0x02C, self.mtime);
        put32!(0x030, self.wtime);
        put16!(0x034, self.mnt_count);
        put16!(0x036, self.max_mnt_count);
        put16!(0x038, crate::ondisk::constants::EXT4_MAGIC);
        put16!(0x03A, self.state);
        put16!(0x03C, self.errors);
        put16!(0x03E, self.minor_rev_level);
        put32!(0x040, self.lastcheck);
        put32!(0x044, self.checkinterval);
        put32!(0x048, self.creator_os);
        put32!(0x04C, self.rev_level);
        put16!(0x050, self.def_resuid);
        put16!(0x052, self.def_resgid);
        put32!(0x054, self.first_ino);
        put16!(0x058, self.inode_size);
        put16!(0x05A, self.block_group_nr);
        put32!(0x05C, self.feature_compat);
        put32!(0x060, self.feature_incompat);
        put32!(0x064, self.feature_ro_compat);
        b[0x068..0x078].copy_from_slice(&self.uuid);
        b[0x078..0x088].copy_from_slice(&self.volume_name);
        b[0x088..0x0C8].copy_from_slice(&self.last_mounted);
        put16!(0x0CE, self.reserved_gdt_blocks);
        put16!(0x0FE, self.desc_size);
        put32!(0x100, self.default_mount_opts);
        b[0x174] = self.log_groups_per_flex;
        b[0x175] = self.checksum_type;

        debug_assert_eq!(
            u16::from_le_bytes([b[MAGIC_OFFSET], b[MAGIC_OFFSET + 1]]),
            crate::ondisk::constants::EXT4_MAGIC
        );
        b
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn magic_at_fixed_offset() {
        let sb = Superblock::new(4096, 3);
        let bytes = sb.to_bytes();
        assert_eq!(
            u16::from_le_bytes([bytes[MAGIC_OFFSET], bytes[MAGIC_OFFSET + 1]]),
            0xEF53
        );
    }

    #[test]
    fn log_block_size_matches_4k() {
        let sb = Superblock::new(4096, 3);
        assert_eq!(sb.log_block_size, 2); // 4096 = 1024 << 2
    }

    #[test]
    fn uuid_is_nonzero() {
        let sb = Superblock::new(4096, 3);
        assert!(sb.uuid.iter().any(|&b| b != 0));
    }
}
