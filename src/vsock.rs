//! Vsock port allocation and the transport abstraction the agent client,
//! stdio plumbing and Unix-socket relays all dial/listen through.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_vsock::{VsockAddr, VsockListener, VsockStream};

use crate::error::{Error, Result};

/// The agent's fixed listening port, chosen well below the ephemeral range
/// allocated by [`VsockPortAllocator`].
pub const AGENT_PORT: u32 = 1024;

/// Shared, thread-safe allocator for ephemeral host vsock ports, per §5:
/// `fetch_add(1)` from a 32-bit counter starting at `0x10000000`. No
/// bookkeeping for reuse — the space is treated as effectively infinite for
/// one container's lifetime.
#[derive(Clone)]
pub struct VsockPortAllocator {
    next: Arc<AtomicU32>,
}

impl VsockPortAllocator {
    pub fn new() -> Self {
        Self {
            next: Arc::new(AtomicU32::new(0x1000_0000)),
        }
    }

    pub fn allocate(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for VsockPortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// A byte-stream connection to or from the guest, the minimal surface the
/// stdio pumps and relays need.
pub trait VsockConnection: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> VsockConnection for T {}

/// Host-side vsock operations, abstracted so tests can swap in an in-memory
/// transport without a real guest CID to dial.
#[async_trait::async_trait]
pub trait VsockTransport: Send + Sync {
    async fn connect(&self, cid: u32, port: u32) -> Result<Box<dyn VsockConnection>>;
    async fn listen(&self, port: u32) -> Result<Box<dyn VsockListenerHandle>>;
}

/// A bound listener awaiting inbound guest connections.
#[async_trait::async_trait]
pub trait VsockListenerHandle: Send {
    async fn accept(&mut self) -> Result<Box<dyn VsockConnection>>;
}

/// The real Linux `tokio-vsock` transport.
pub struct LinuxVsockTransport;

#[async_trait::async_trait]
impl VsockTransport for LinuxVsockTransport {
    async fn connect(&self, cid: u32, port: u32) -> Result<Box<dyn VsockConnection>> {
        let stream = VsockStream::connect(VsockAddr::new(cid, port))
            .await
            .map_err(|e| Error::internal(format!("vsock connect to {cid}:{port} failed: {e}")))?;
        Ok(Box::new(stream))
    }

    async fn listen(&self, port: u32) -> Result<Box<dyn VsockListenerHandle>> {
        let listener = VsockListener::bind(VsockAddr::new(libc::VMADDR_CID_ANY, port))
            .map_err(|e| Error::internal(format!("vsock listen on port {port} failed: {e}")))?;
        Ok(Box::new(BoundListener { listener }))
    }
}

struct BoundListener {
    listener: VsockListener,
}

#[async_trait::async_trait]
impl VsockListenerHandle for BoundListener {
    async fn accept(&mut self) -> Result<Box<dyn VsockConnection>> {
        let (stream, _addr) = self
            .listener
            .accept()
            .await
            .map_err(|e| Error::internal(format!("vsock accept failed: {e}")))?;
        Ok(Box::new(stream))
    }
}

/// An in-memory [`VsockTransport`]: a `connect(cid, port)` pairs up with a
/// prior `listen(port)` on the same transport via a `tokio::io::duplex`,
/// regardless of `cid` (tests run a single fake guest). Lets container,
/// stdio and relay tests exercise the real plumbing without a hypervisor.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct InMemoryVsockTransport {
    listeners: std::sync::Mutex<
        std::collections::HashMap<u32, tokio::sync::mpsc::UnboundedSender<tokio::io::DuplexStream>>,
    >,
}

#[cfg(test)]
impl InMemoryVsockTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
#[async_trait::async_trait]
impl VsockTransport for InMemoryVsockTransport {
    async fn connect(&self, _cid: u32, port: u32) -> Result<Box<dyn VsockConnection>> {
        let sender = self
            .listeners
            .lock()
            .unwrap()
            .get(&port)
            .cloned()
            .ok_or_else(|| Error::internal(format!("in-memory transport: nothing listening on port {port}")))?;
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        sender
            .send(theirs)
            .map_err(|_| Error::internal(format!("in-memory transport: listener on port {port} gone")))?;
        Ok(Box::new(ours))
    }

    async fn listen(&self, port: u32) -> Result<Box<dyn VsockListenerHandle>> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        self.listeners.lock().unwrap().insert(port, tx);
        Ok(Box::new(InMemoryListenerHandle { rx }))
    }
}

#[cfg(test)]
struct InMemoryListenerHandle {
    rx: tokio::sync::mpsc::UnboundedReceiver<tokio::io::DuplexStream>,
}

#[cfg(test)]
#[async_trait::async_trait]
impl VsockListenerHandle for InMemoryListenerHandle {
    async fn accept(&mut self) -> Result<Box<dyn VsockConnection>> {
        self.rx
            .recv()
            .await
            .map(|s| Box::new(s) as Box<dyn VsockConnection>)
            .ok_or_else(|| Error::internal("in-memory transport: listener closed"))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn allocator_increments_from_base() {
        let alloc = VsockPortAllocator::new();
        assert_eq!(alloc.allocate(), 0x1000_0000);
        assert_eq!(alloc.allocate(), 0x1000_0001);
    }

    #[test]
    fn allocator_is_shared_across_clones() {
        let alloc = VsockPortAllocator::new();
        let clone = alloc.clone();
        alloc.allocate();
        assert_eq!(clone.allocate(), 0x1000_0001);
    }

    #[tokio::test]
    async fn in_memory_transport_connects_to_a_waiting_listener() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let transport = InMemoryVsockTransport::new();
        let mut listener = transport.listen(AGENT_PORT).await.unwrap();

        let accept = tokio::spawn(async move {
            let mut guest_side = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            guest_side.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut host_side = transport.connect(3, AGENT_PORT).await.unwrap();
        host_side.write_all(b"hello").await.unwrap();

        assert_eq!(&accept.await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn in_memory_transport_rejects_connect_without_a_listener() {
        let transport = InMemoryVsockTransport::new();
        assert!(transport.connect(3, AGENT_PORT).await.is_err());
    }
}
