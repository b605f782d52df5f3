//! Unix-socket relays (§4.6): bridges a host AF_UNIX socket to a guest
//! vsock endpoint, in either direction, with two half-duplex pumps per
//! connection that tear each other down on hangup.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::vsock::{VsockConnection, VsockPortAllocator, VsockTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayDirection {
    /// Host dials toward the guest; the guest's dentry-relay handler opens
    /// a connection, and the host answers by connecting out to a local
    /// AF_UNIX socket.
    Into,
    /// Host binds a local AF_UNIX socket; each accepted connection is
    /// forwarded to the guest over vsock.
    OutOf,
}

#[derive(Debug, Clone)]
pub struct RelaySpec {
    pub source: String,
    pub destination: String,
    pub permissions: Option<u32>,
    pub direction: RelayDirection,
}

impl RelaySpec {
    /// Stable 36-character id, a UUID-shaped hash of the relay's identity,
    /// used to dedupe concurrent starts of an identical relay.
    pub fn id(&self) -> String {
        let perm = self.permissions.map(|p| p.to_string()).unwrap_or_default();
        let dir = match self.direction {
            RelayDirection::Into => "into",
            RelayDirection::OutOf => "out-of",
        };
        let key = format!(
            "src:{}|dst:{}|perm:{}|dir:{}",
            self.source, self.destination, perm, dir
        );
        let digest = Sha256::digest(key.as_bytes());
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Uuid::from_bytes(bytes).to_string()
    }
}

/// Tracks every relay currently running for one container, rejecting a
/// second start of an identical relay while the first is still live.
#[derive(Default, Clone)]
pub struct RelayRegistry {
    active: Arc<Mutex<HashSet<String>>>,
}

impl RelayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the relay described by `spec`, dialing/listening per
    /// `spec.direction`. Each accepted connection is pumped half-duplex in
    /// both directions until either side reports EOF, at which point both
    /// descriptors close (in-flight bytes in the other direction are lost,
    /// per §4.6's accepted open question).
    pub async fn start(
        &self,
        spec: RelaySpec,
        transport: Arc<dyn VsockTransport>,
        ports: VsockPortAllocator,
        guest_cid: u32,
    ) -> Result<UnixSocketRelay> {
        let id = spec.id();
        {
            let mut active = self.active.lock().expect("relay registry mutex poisoned");
            if !active.insert(id.clone()) {
                return Err(Error::invalid_state(
                    "start relay",
                    "not-running",
                    "already-running",
                ));
            }
        }

        let accept_task = match spec.direction {
            RelayDirection::OutOf => spawn_outof(spec.clone(), transport, guest_cid)?,
            RelayDirection::Into => {
                let port = ports.allocate();
                spawn_into(spec.clone(), transport, port).await?
            }
        };

        Ok(UnixSocketRelay {
            id,
            registry: self.clone(),
            accept_task: Some(accept_task),
        })
    }
}

fn spawn_outof(
    spec: RelaySpec,
    transport: Arc<dyn VsockTransport>,
    guest_cid: u32,
) -> Result<JoinHandle<()>> {
    let path = spec.destination.clone();
    if Path::new(&path).exists() {
        std::fs::remove_file(&path)
            .map_err(|e| Error::internal(format!("removing stale relay socket {path}: {e}")))?;
    }
    let listener = UnixListener::bind(&path)
        .map_err(|e| Error::internal(format!("binding relay socket {path}: {e}")))?;
    if let Some(mode) = spec.permissions {
        set_permissions(&path, mode)?;
    }
    let guest_port: u32 = spec.source.parse().map_err(|_| {
        Error::invalid_argument(format!(
            "OutOf relay source must be a vsock port, got {}",
            spec.source
        ))
    })?;

    Ok(tokio::spawn(async move {
        loop {
            let (unix_stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::debug!("relay socket {path} accept failed, stopping: {e}");
                    break;
                }
            };
            let transport = transport.clone();
            tokio::spawn(async move {
                match transport.connect(guest_cid, guest_port).await {
                    Ok(vsock_conn) => pump_both_ways(unix_stream, vsock_conn).await,
                    Err(e) => tracing::debug!("relay dial to guest port {guest_port} failed: {e}"),
                }
            });
        }
    }))
}

async fn spawn_into(
    spec: RelaySpec,
    transport: Arc<dyn VsockTransport>,
    port: u32,
) -> Result<JoinHandle<()>> {
    let mut listener = transport.listen(port).await?;
    let host_path = spec.source.clone();
    Ok(tokio::spawn(async move {
        loop {
            let vsock_conn = match listener.accept().await {
                Ok(c) => c,
                Err(e) => {
                    tracing::debug!("relay vsock listener on port {port} failed, stopping: {e}");
                    break;
                }
            };
            let host_path = host_path.clone();
            tokio::spawn(async move {
                match UnixStream::connect(&host_path).await {
                    Ok(unix_stream) => pump_both_ways(unix_stream, vsock_conn).await,
                    Err(e) => tracing::debug!("relay dial to host socket {host_path} failed: {e}"),
                }
            });
        }
    }))
}

fn set_permissions(path: &str, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| Error::internal(format!("setting relay socket permissions on {path}: {e}")))
}

async fn pump_both_ways(unix_stream: UnixStream, vsock_conn: Box<dyn VsockConnection>) {
    let (mut unix_read, mut unix_write) = tokio::io::split(unix_stream);
    let (mut vsock_read, mut vsock_write) = tokio::io::split(vsock_conn);

    let to_guest = async {
        let mut buf = [0u8; 8192];
        loop {
            let n = match unix_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if vsock_write.write_all(&buf[..n]).await.is_err() {
                break;
            }
        }
    };
    let to_host = async {
        let mut buf = [0u8; 8192];
        loop {
            let n = match vsock_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if unix_write.write_all(&buf[..n]).await.is_err() {
                break;
            }
        }
    };
    tokio::select! {
        _ = to_guest => {},
        _ = to_host => {},
    }
}

/// A running relay. Always stop explicitly via [`stop`](Self::stop); a bare
/// drop leaves the registry entry behind.
pub struct UnixSocketRelay {
    id: String,
    registry: RelayRegistry,
    accept_task: Option<JoinHandle<()>>,
}

impl UnixSocketRelay {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// For `OutOf` relays this also removes the host socket file; `Into`
    /// relays just release the guest-side port.
    pub async fn stop(mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        self.registry
            .active
            .lock()
            .expect("relay registry mutex poisoned")
            .remove(&self.id);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn spec(direction: RelayDirection) -> RelaySpec {
        RelaySpec {
            source: "/tmp/a.sock".into(),
            destination: "/tmp/b.sock".into(),
            permissions: Some(0o600),
            direction,
        }
    }

    #[test]
    fn id_is_stable_for_identical_specs() {
        assert_eq!(spec(RelayDirection::Into).id(), spec(RelayDirection::Into).id());
    }

    #[test]
    fn id_differs_by_direction() {
        assert_ne!(
            spec(RelayDirection::Into).id(),
            spec(RelayDirection::OutOf).id()
        );
    }

    #[test]
    fn id_is_36_characters() {
        assert_eq!(spec(RelayDirection::Into).id().len(), 36);
    }
}
