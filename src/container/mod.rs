//! Container lifecycle: the state machine, its process handles, and the
//! ambient VM/network/DNS configuration types it's driven by.

mod config;
mod process;
mod state;

pub use config::{DnsConfig, IpNet, Kernel, NetworkInterfaceConfig, VmConfig};
pub use process::LinuxProcess;
pub use state::{AgentConnector, Container, ContainerStatus, Vm, VmManager};
