//! Stdio plumbing (§4.5): host-side listeners for a process's wired
//! stdin/stdout/stderr, connected once the guest agent dials back after
//! `createProcess`, then pumped until EOF or teardown.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::vsock::{VsockConnection, VsockListenerHandle, VsockPortAllocator, VsockTransport};

/// The ports allocated for a process's wired streams, handed to
/// `agent.createProcess` so the guest knows where to dial back.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdioPorts {
    pub stdin: Option<u32>,
    pub stdout: Option<u32>,
    pub stderr: Option<u32>,
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct PendingStream<T> {
    listener: Box<dyn VsockListenerHandle>,
    io: T,
}

/// Listeners bound but not yet connected to the guest. Exists so the
/// container state machine can read back [`StdioPorts`] for
/// `createProcess` before blocking on the guest's connect-back.
pub struct PendingStdio {
    stdin: Option<PendingStream<BoxedReader>>,
    stdout: Option<PendingStream<BoxedWriter>>,
    stderr: Option<PendingStream<BoxedWriter>>,
}

/// A live, pumped stdio session for one process.
pub struct StdioPlumbing {
    stdin_task: Option<JoinHandle<()>>,
    stdout_task: Option<JoinHandle<()>>,
    stderr_task: Option<JoinHandle<()>>,
}

impl PendingStdio {
    /// Binds a vsock listener for each stream the caller wired up. Rejects
    /// a separate stderr stream on a terminal process, since a pty merges
    /// stdout and stderr onto one fd.
    pub async fn listen(
        transport: &dyn VsockTransport,
        ports: &VsockPortAllocator,
        stdin: Option<BoxedReader>,
        stdout: Option<BoxedWriter>,
        stderr: Option<BoxedWriter>,
        terminal: bool,
    ) -> Result<(Self, StdioPorts)> {
        if stderr.is_some() && terminal {
            return Err(Error::invalid_argument(
                "cannot attach a separate stderr stream to a terminal process",
            ));
        }

        let mut out_ports = StdioPorts::default();

        let stdin = match stdin {
            Some(io) => {
                let port = ports.allocate();
                out_ports.stdin = Some(port);
                Some(PendingStream {
                    listener: transport.listen(port).await?,
                    io,
                })
            }
            None => None,
        };
        let stdout = match stdout {
            Some(io) => {
                let port = ports.allocate();
                out_ports.stdout = Some(port);
                Some(PendingStream {
                    listener: transport.listen(port).await?,
                    io,
                })
            }
            None => None,
        };
        let stderr = match stderr {
            Some(io) => {
                let port = ports.allocate();
                out_ports.stderr = Some(port);
                Some(PendingStream {
                    listener: transport.listen(port).await?,
                    io,
                })
            }
            None => None,
        };

        Ok((Self { stdin, stdout, stderr }, out_ports))
    }

    /// Waits (bounded by `timeout`, per §5) for the guest to connect back on
    /// every allocated stream, then spawns the pumps.
    pub async fn accept(self, timeout: Duration) -> Result<StdioPlumbing> {
        let stdin_task = match self.stdin {
            Some(pending) => Some(accept_and_pump_stdin(pending, timeout).await?),
            None => None,
        };
        let stdout_task = match self.stdout {
            Some(pending) => Some(accept_and_pump_output(pending, timeout).await?),
            None => None,
        };
        let stderr_task = match self.stderr {
            Some(pending) => Some(accept_and_pump_output(pending, timeout).await?),
            None => None,
        };
        Ok(StdioPlumbing {
            stdin_task,
            stdout_task,
            stderr_task,
        })
    }
}

async fn accept_connection(
    mut listener: Box<dyn VsockListenerHandle>,
    timeout: Duration,
) -> Result<Box<dyn VsockConnection>> {
    tokio::time::timeout(timeout, listener.accept())
        .await
        .map_err(|_| Error::invalid_state("stdio connect", "connected", "awaiting-guest"))?
}

async fn accept_and_pump_stdin(
    pending: PendingStream<BoxedReader>,
    timeout: Duration,
) -> Result<JoinHandle<()>> {
    let conn = accept_connection(pending.listener, timeout).await?;
    let reader = pending.io;
    Ok(tokio::spawn(pump_stdin(reader, conn)))
}

async fn accept_and_pump_output(
    pending: PendingStream<BoxedWriter>,
    timeout: Duration,
) -> Result<JoinHandle<()>> {
    let conn = accept_connection(pending.listener, timeout).await?;
    let writer = pending.io;
    Ok(tokio::spawn(pump_output(conn, writer)))
}

async fn pump_stdin(mut reader: BoxedReader, mut conn: Box<dyn VsockConnection>) {
    let mut buf = [0u8; 8192];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!("stdin reader errored, stopping pump: {e}");
                break;
            }
        };
        if let Err(e) = conn.write_all(&buf[..n]).await {
            tracing::debug!("stdin write to guest failed, stopping pump: {e}");
            break;
        }
    }
}

async fn pump_output(mut conn: Box<dyn VsockConnection>, mut writer: BoxedWriter) {
    let mut buf = [0u8; 8192];
    loop {
        let n = match conn.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!("stdio read from guest failed: {e}");
                break;
            }
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            tracing::debug!("stdio write to caller failed: {e}");
            break;
        }
    }
}

impl StdioPlumbing {
    /// Cancels the stdin pump immediately, then gives stdout/stderr up to
    /// 2s (polling every 50ms) to drain whatever the guest already sent
    /// before forcibly aborting them.
    pub async fn delete(mut self) {
        if let Some(task) = self.stdin_task.take() {
            task.abort();
        }
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        for task in [&self.stdout_task, &self.stderr_task].into_iter().flatten() {
            while !task.is_finished() && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
        if let Some(task) = self.stdout_task.take() {
            task.abort();
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}

/// Used by tests that only need to confirm `PendingStdio`'s construction
/// rejects a terminal+stderr combination without standing up real vsock
/// plumbing.
#[cfg(test)]
mod test {
    use super::*;
    use crate::vsock::VsockListenerHandle;
    use async_trait::async_trait;

    struct DeadTransport;

    #[async_trait]
    impl VsockTransport for DeadTransport {
        async fn connect(&self, _cid: u32, _port: u32) -> Result<Box<dyn VsockConnection>> {
            Err(Error::internal("not used in this test"))
        }
        async fn listen(&self, _port: u32) -> Result<Box<dyn VsockListenerHandle>> {
            Err(Error::internal("not used in this test"))
        }
    }

    #[tokio::test]
    async fn terminal_process_rejects_separate_stderr() {
        let transport = DeadTransport;
        let allocator = VsockPortAllocator::new();
        let stderr: BoxedWriter = Box::new(tokio::io::sink());
        let result = PendingStdio::listen(&transport, &allocator, None, None, Some(stderr), true).await;
        assert!(result.is_err());
    }
}
