//! A host-side container runtime: an ext4 image formatter plus the per-VM
//! lifecycle, vsock I/O plane and agent protocol that drive a running
//! container from the host side.
//!
//! [`formatter`] and [`archive_unpacker`] build and populate ext4 images
//! offline, with no VM involved. Everything else — [`container`],
//! [`agent`], [`stdio`], [`relay`], [`mount_planner`], [`time_sync`] —
//! drives a booted VM over vsock.

pub mod agent;
pub mod archive_unpacker;
pub mod block_writer;
pub mod container;
pub mod error;
pub mod file_tree;
pub mod formatter;
pub mod mount_planner;
pub mod ondisk;
pub mod relay;
pub mod stdio;
pub mod time_sync;
pub mod util;
pub mod vsock;
pub mod xattr_encoder;
