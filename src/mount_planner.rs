//! Assigns concrete devices/tags to a VM's configured mounts, and composes
//! the kernel command line those mounts (and the rootfs) end up needing.

use sha2::{Digest, Sha256};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How a mount's runtime placement is decided.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MountRuntimeOptions {
    BlockDevice(Vec<String>),
    Virtiofs(Vec<String>),
    Any,
}

/// A mount as configured by the caller, before device/tag assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mount {
    pub kind: String,
    pub source: String,
    pub destination: String,
    pub options: Vec<String>,
    pub runtime_options: MountRuntimeOptions,
}

/// A mount after device-letter/tag assignment, ready to hand to the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachedFilesystem {
    pub kind: String,
    /// `/dev/vdX` for block devices, or a virtiofs tag.
    pub source: String,
    pub destination: String,
    pub options: Vec<String>,
}

/// The initfs type the kernel mounts as root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InitfsType {
    Virtiofs,
    Ext4,
}

/// Monotonic `a, b, c, …, z, aa, ab, …` device-letter allocator shared across
/// a VM's block-device mounts.
#[derive(Default)]
struct DeviceLetterAllocator {
    next: u32,
}

impl DeviceLetterAllocator {
    fn allocate(&mut self) -> String {
        let mut n = self.next;
        self.next += 1;
        let mut letters = Vec::new();
        loop {
            letters.push((b'a' + (n % 26) as u8) as char);
            n = n / 26;
            if n == 0 {
                break;
            }
            n -= 1;
        }
        letters.iter().rev().collect()
    }
}

/// Assigns `/dev/vdX` letters to block mounts and virtiofs tags to virtiofs
/// mounts. If the root filesystem is itself a block device, `vda` is
/// preallocated to it before any other mount is assigned.
pub struct MountPlanner {
    letters: DeviceLetterAllocator,
}

impl MountPlanner {
    pub fn new() -> Self {
        Self {
            letters: DeviceLetterAllocator::default(),
        }
    }

    /// Plans the root mount first (so a block-device root claims `vda`
    /// before any other mount can), then every additional mount.
    pub fn plan(&mut self, root: &Mount, mounts: &[Mount]) -> (AttachedFilesystem, Vec<AttachedFilesystem>) {
        let root_attached = self.plan_one(root);
        let others = mounts.iter().map(|m| self.plan_one(m)).collect();
        (root_attached, others)
    }

    fn plan_one(&mut self, mount: &Mount) -> AttachedFilesystem {
        let source = match &mount.runtime_options {
            MountRuntimeOptions::BlockDevice(_) => format!("/dev/vd{}", self.letters.allocate()),
            MountRuntimeOptions::Virtiofs(_) => virtiofs_tag(&mount.source),
            MountRuntimeOptions::Any => mount.source.clone(),
        };
        AttachedFilesystem {
            kind: mount.kind.clone(),
            source,
            destination: mount.destination.clone(),
            options: mount.options.clone(),
        }
    }
}

impl Default for MountPlanner {
    fn default() -> Self {
        Self::new()
    }
}

/// A short, deterministic virtiofs tag derived from a hash of the host path.
/// Kept to 32 hex characters (virtiofs tags are capped at 36 bytes by the
/// kernel).
fn virtiofs_tag(host_path: &str) -> String {
    let digest = Sha256::digest(host_path.as_bytes());
    hex_encode(&digest)[..32].to_string()
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Composes `<kernelArgs> init=/sbin/vminitd ro rootfstype={virtiofs|ext4}
/// root={rootfs|/dev/vda} [-- <initArgs>]`.
pub struct KernelCmdline;

impl KernelCmdline {
    pub fn compose(
        kernel_args: &[String],
        initfs_type: InitfsType,
        rootfs_source: &str,
        init_args: &[String],
    ) -> Result<String> {
        let rootfstype = match initfs_type {
            InitfsType::Virtiofs => "virtiofs",
            InitfsType::Ext4 => "ext4",
        };
        let mut tokens: Vec<String> = kernel_args.to_vec();
        tokens.push("init=/sbin/vminitd".to_string());
        tokens.push("ro".to_string());
        tokens.push(format!("rootfstype={rootfstype}"));
        tokens.push(format!("root={rootfs_source}"));
        if !init_args.is_empty() {
            tokens.push("--".to_string());
            tokens.extend(init_args.iter().cloned());
        }
        Ok(tokens.join(" "))
    }

    /// Validates an initfs type string from configuration, per §4.4
    /// ("unsupported initfs types are fatal").
    pub fn parse_initfs_type(s: &str) -> Result<InitfsType> {
        match s {
            "virtiofs" => Ok(InitfsType::Virtiofs),
            "ext4" => Ok(InitfsType::Ext4),
            other => Err(Error::unsupported(format!("unsupported initfs type: {other}"))),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn device_letters_increment_and_wrap_to_two_chars() {
        let mut alloc = DeviceLetterAllocator::default();
        let letters: Vec<String> = (0..28).map(|_| alloc.allocate()).collect();
        assert_eq!(letters[0], "a");
        assert_eq!(letters[25], "z");
        assert_eq!(letters[26], "aa");
        assert_eq!(letters[27], "ab");
    }

    #[test]
    fn block_root_claims_vda_before_other_mounts() {
        let mut planner = MountPlanner::new();
        let root = Mount {
            kind: "ext4".into(),
            source: "rootfs".into(),
            destination: "/".into(),
            options: vec![],
            runtime_options: MountRuntimeOptions::BlockDevice(vec![]),
        };
        let mounts = vec![Mount {
            kind: "ext4".into(),
            source: "/data".into(),
            destination: "/data".into(),
            options: vec![],
            runtime_options: MountRuntimeOptions::BlockDevice(vec![]),
        }];
        let (root_attached, others) = planner.plan(&root, &mounts);
        assert_eq!(root_attached.source, "/dev/vda");
        assert_eq!(others[0].source, "/dev/vdb");
    }

    #[test]
    fn virtiofs_tag_is_deterministic() {
        let a = virtiofs_tag("/home/user/project");
        let b = virtiofs_tag("/home/user/project");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn cmdline_includes_init_args_after_separator() {
        let cmdline = KernelCmdline::compose(
            &["console=ttyS0".to_string()],
            InitfsType::Ext4,
            "/dev/vda",
            &["--verbose".to_string()],
        )
        .unwrap();
        assert_eq!(
            cmdline,
            "console=ttyS0 init=/sbin/vminitd ro rootfstype=ext4 root=/dev/vda -- --verbose"
        );
    }

    #[test]
    fn unsupported_initfs_type_is_fatal() {
        assert!(KernelCmdline::parse_initfs_type("btrfs").is_err());
    }
}
