//! Packed, bit-exact ext4 on-disk structures.
//!
//! Every type here serializes to little-endian bytes explicitly (see the
//! design note on packed structs); none of it relies on the host's native
//! struct layout.

pub mod constants;
pub mod dirent;
pub mod extent;
pub mod group_desc;
pub mod inode;
pub mod superblock;
pub mod xattr;
