//! Ambient VM/network/DNS configuration deserialized from the caller's
//! config document (serde + serde_json, per the host's configuration
//! model).

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error as CrateError;
use crate::mount_planner::Mount;

/// A minimal `address/prefix_len` pair, serialized as its string form (e.g.
/// `"10.0.2.15/24"`). Implemented locally rather than pulling in a
/// dedicated crate, since this is the only place the config model needs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpNet {
    pub addr: IpAddr,
    pub prefix_len: u8,
}

impl fmt::Display for IpNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl FromStr for IpNet {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| format!("expected addr/prefix_len, got {s}"))?;
        let addr: IpAddr = addr
            .parse()
            .map_err(|e| format!("invalid address in {s}: {e}"))?;
        let prefix_len: u8 = prefix
            .parse()
            .map_err(|e| format!("invalid prefix length in {s}: {e}"))?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix_len > max {
            return Err(format!("prefix length {prefix_len} exceeds {max} for {addr}"));
        }
        Ok(Self { addr, prefix_len })
    }
}

impl Serialize for IpNet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for IpNet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(DeError::custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInterfaceConfig {
    pub address: IpNet,
    pub gateway: Option<IpAddr>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DnsConfig {
    pub nameservers: Vec<IpAddr>,
    pub domain: Option<String>,
    #[serde(default)]
    pub search: Vec<String>,
    #[serde(default)]
    pub options: Vec<String>,
}

/// The kernel image and initfs the VM boots, per §4.4/§6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kernel {
    pub image_path: String,
    /// `"virtiofs"` or `"ext4"`; anything else is rejected by
    /// [`crate::mount_planner::KernelCmdline::parse_initfs_type`].
    pub initfs_type: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmConfig {
    #[serde(default = "default_cpus")]
    pub cpus: u32,
    #[serde(default = "default_memory_bytes")]
    pub memory_bytes: u64,
    #[serde(default)]
    pub rosetta: bool,
    #[serde(default)]
    pub nested_virt: bool,
    #[serde(default)]
    pub interfaces: Vec<NetworkInterfaceConfig>,
    /// Mounts other than the container's own rootfs, attached to the VM at
    /// creation time.
    #[serde(default)]
    pub mounts: Vec<Mount>,
    pub dns: Option<DnsConfig>,
    pub hostname: Option<String>,
    pub kernel: Kernel,
}

fn default_cpus() -> u32 {
    2
}

fn default_memory_bytes() -> u64 {
    1024 * 1024 * 1024
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            cpus: default_cpus(),
            memory_bytes: default_memory_bytes(),
            rosetta: false,
            nested_virt: false,
            interfaces: Vec::new(),
            mounts: Vec::new(),
            dns: None,
            hostname: None,
            kernel: Kernel {
                image_path: String::new(),
                initfs_type: "ext4".to_string(),
                args: Vec::new(),
            },
        }
    }
}

impl VmConfig {
    /// Parses a configuration document, folding any serde path context
    /// into an `Error::InvalidArgument` rather than surfacing the raw
    /// deserialization error.
    pub fn from_json(data: &str) -> Result<Self, CrateError> {
        serde_json::from_str(data)
            .map_err(|e| CrateError::invalid_argument(format!("invalid VM configuration: {e}")))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ipnet_round_trips_through_string_form() {
        let net: IpNet = "10.0.2.15/24".parse().unwrap();
        assert_eq!(net.to_string(), "10.0.2.15/24");
    }

    #[test]
    fn ipnet_rejects_out_of_range_prefix() {
        assert!("10.0.2.15/33".parse::<IpNet>().is_err());
    }

    #[test]
    fn malformed_config_becomes_invalid_argument() {
        let err = VmConfig::from_json("{ not json").unwrap_err();
        assert!(matches!(err.code(), crate::error::ErrorCode::InvalidArgument));
    }
}
