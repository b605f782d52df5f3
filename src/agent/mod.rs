//! The guest agent: wire framing plus the RPC surface the container state
//! machine and its process/network helpers drive.

mod client;
mod protocol;

pub use client::{AgentClient, RpcAgentClient};
#[cfg(test)]
pub(crate) use client::FakeAgentClient;
pub use protocol::{Request, Response, RpcError};
