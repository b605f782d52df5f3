//! The guest agent RPC contract (§4.7): process lifecycle, filesystem,
//! network and time operations, plus the optional socket-relay sub-protocol.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use oci_spec::runtime::Process as OciProcess;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::agent::protocol::{Request, Response, RpcError};
use crate::error::{Error, ErrorCode, Result};
use crate::mount_planner::AttachedFilesystem;
use crate::vsock::{VsockTransport, AGENT_PORT};

/// The full surface the container state machine drives. Implemented by
/// [`RpcAgentClient`] against a real vsock connection and, in tests, by a
/// fake that records calls.
#[async_trait::async_trait]
pub trait AgentClient: Send + Sync {
    async fn create_process(
        &self,
        id: &str,
        container_id: Option<&str>,
        stdin_port: Option<u32>,
        stdout_port: Option<u32>,
        stderr_port: Option<u32>,
        spec: &OciProcess,
        options: Option<Value>,
    ) -> Result<()>;
    async fn start_process(&self, id: &str) -> Result<i32>;
    async fn signal_process(&self, id: &str, signal: i32) -> Result<()>;
    async fn resize_process(&self, id: &str, cols: u16, rows: u16) -> Result<()>;
    async fn wait_process(&self, id: &str, timeout: Option<Duration>) -> Result<i32>;
    async fn delete_process(&self, id: &str) -> Result<()>;

    async fn mount(&self, fs: &AttachedFilesystem) -> Result<()>;
    async fn umount(&self, path: &str, flags: u32) -> Result<()>;
    async fn mkdir(&self, path: &str, recursive: bool, perms: u32) -> Result<()>;

    /// Writes `/etc/hostname` in the guest (a single line containing
    /// `hostname`) and applies it as the running kernel hostname.
    async fn set_hostname(&self, hostname: &str) -> Result<()>;

    async fn address_add(&self, interface: &str, address: &str) -> Result<()>;
    async fn up(&self, interface: &str) -> Result<()>;
    async fn down(&self, interface: &str) -> Result<()>;
    async fn route_add_default(&self, interface: &str, gateway: IpAddr) -> Result<()>;
    async fn configure_dns(
        &self,
        nameservers: &[IpAddr],
        domain: Option<&str>,
        search: &[String],
        options: &[String],
        location: &str,
    ) -> Result<()>;

    /// Runs the agent's one-time post-connect setup (mounting pseudo
    /// filesystems, seeding `/etc`, etc.) before the container does
    /// anything else with it.
    async fn standard_setup(&self) -> Result<()>;

    async fn set_time(&self, sec: i64, usec: i64) -> Result<()>;

    async fn getenv(&self, key: &str) -> Result<Option<String>>;
    async fn setenv(&self, key: &str, value: &str) -> Result<()>;
    async fn kill(&self, pid: i32, signal: i32) -> Result<()>;

    /// Whether the connected agent advertised `SocketRelayAgent` support.
    fn supports_socket_relay(&self) -> bool;
    async fn relay_socket(&self, port: u32, configuration: &Value) -> Result<()>;
    async fn stop_socket_relay(&self, configuration: &Value) -> Result<()>;
}

/// Newline-delimited-JSON agent client over a single bidirectional vsock
/// connection.
pub struct RpcAgentClient {
    writer: Mutex<Box<dyn tokio::io::AsyncWrite + Send + Unpin>>,
    next_id: AtomicU64,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>>,
    capabilities: HashSet<String>,
    reader_task: JoinHandle<()>,
}

impl RpcAgentClient {
    /// Dials the agent's well-known port and starts the background reader
    /// task that demultiplexes responses onto their waiting callers.
    pub async fn connect(
        transport: &dyn VsockTransport,
        cid: u32,
        capabilities: HashSet<String>,
    ) -> Result<Self> {
        let conn = transport.connect(cid, AGENT_PORT).await?;
        let (read_half, write_half) = tokio::io::split(conn);
        let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let pending_for_task = pending.clone();
        let reader_task = tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        if let Ok(response) = serde_json::from_str::<Response>(&line) {
                            if let Some(tx) = pending_for_task.lock().await.remove(&response.id) {
                                let _ = tx.send(response);
                            }
                        } else {
                            tracing::debug!("agent sent an unparseable response line");
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!("agent connection read error: {e}");
                        break;
                    }
                }
            }
        });
        Ok(Self {
            writer: Mutex::new(Box::new(write_half)),
            next_id: AtomicU64::new(1),
            pending,
            capabilities,
            reader_task,
        })
    }

    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let request = Request {
            id,
            method: method.to_string(),
            params,
        };
        let mut line = serde_json::to_vec(&request)
            .map_err(|e| Error::internal(format!("encoding {method} request: {e}")))?;
        line.push(b'\n');
        {
            let mut writer = self.writer.lock().await;
            writer
                .write_all(&line)
                .await
                .map_err(|e| Error::internal(format!("writing {method} request: {e}")))?;
            writer
                .flush()
                .await
                .map_err(|e| Error::internal(format!("flushing {method} request: {e}")))?;
        }

        let response = rx.await.map_err(|_| {
            Error::internal(format!("agent connection closed before {method} reply"))
        })?;
        if let Some(rpc_error) = response.error {
            return Err(map_rpc_error(rpc_error));
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    async fn call_timed(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        match timeout {
            None => self.call(method, params).await,
            Some(d) => tokio::time::timeout(d, self.call(method, params))
                .await
                .map_err(|_| Error::generic(ErrorCode::InvalidState, format!("{method} timed out")))?,
        }
    }

    fn require_socket_relay(&self) -> Result<()> {
        if self.capabilities.contains("SocketRelayAgent") {
            Ok(())
        } else {
            Err(Error::unsupported("agent does not advertise SocketRelayAgent"))
        }
    }
}

impl Drop for RpcAgentClient {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

fn map_rpc_error(rpc_error: RpcError) -> Error {
    let code = match rpc_error.code.as_str() {
        "NotFound" => ErrorCode::NotFound,
        "Exists" => ErrorCode::Exists,
        "InvalidArgument" => ErrorCode::InvalidArgument,
        "InvalidState" => ErrorCode::InvalidState,
        "Unsupported" => ErrorCode::Unsupported,
        _ => ErrorCode::InternalError,
    };
    Error::generic(code, rpc_error.message)
}

fn as_i32(value: Value, field: &str) -> Result<i32> {
    value
        .as_i64()
        .map(|v| v as i32)
        .ok_or_else(|| Error::internal(format!("agent response missing integer {field}")))
}

#[async_trait::async_trait]
impl AgentClient for RpcAgentClient {
    async fn create_process(
        &self,
        id: &str,
        container_id: Option<&str>,
        stdin_port: Option<u32>,
        stdout_port: Option<u32>,
        stderr_port: Option<u32>,
        spec: &OciProcess,
        options: Option<Value>,
    ) -> Result<()> {
        let params = json!({
            "id": id,
            "containerID": container_id,
            "stdinPort": stdin_port,
            "stdoutPort": stdout_port,
            "stderrPort": stderr_port,
            "spec": spec,
            "options": options,
        });
        self.call("createProcess", Some(params)).await?;
        Ok(())
    }

    async fn start_process(&self, id: &str) -> Result<i32> {
        let result = self.call("startProcess", Some(json!({ "id": id }))).await?;
        as_i32(result, "pid")
    }

    async fn signal_process(&self, id: &str, signal: i32) -> Result<()> {
        self.call("signalProcess", Some(json!({ "id": id, "signal": signal })))
            .await?;
        Ok(())
    }

    async fn resize_process(&self, id: &str, cols: u16, rows: u16) -> Result<()> {
        self.call(
            "resizeProcess",
            Some(json!({ "id": id, "cols": cols, "rows": rows })),
        )
        .await?;
        Ok(())
    }

    async fn wait_process(&self, id: &str, timeout: Option<Duration>) -> Result<i32> {
        let result = self
            .call_timed("waitProcess", Some(json!({ "id": id })), timeout)
            .await?;
        as_i32(result, "exit code")
    }

    async fn delete_process(&self, id: &str) -> Result<()> {
        self.call("deleteProcess", Some(json!({ "id": id }))).await?;
        Ok(())
    }

    async fn mount(&self, fs: &AttachedFilesystem) -> Result<()> {
        self.call("mount", Some(json!({ "mount": fs }))).await?;
        Ok(())
    }

    async fn umount(&self, path: &str, flags: u32) -> Result<()> {
        self.call("umount", Some(json!({ "path": path, "flags": flags })))
            .await?;
        Ok(())
    }

    async fn mkdir(&self, path: &str, recursive: bool, perms: u32) -> Result<()> {
        self.call(
            "mkdir",
            Some(json!({ "path": path, "recursive": recursive, "perms": perms })),
        )
        .await?;
        Ok(())
    }

    async fn set_hostname(&self, hostname: &str) -> Result<()> {
        self.call("setHostname", Some(json!({ "hostname": hostname })))
            .await?;
        Ok(())
    }

    async fn address_add(&self, interface: &str, address: &str) -> Result<()> {
        self.call(
            "addressAdd",
            Some(json!({ "interface": interface, "address": address })),
        )
        .await?;
        Ok(())
    }

    async fn up(&self, interface: &str) -> Result<()> {
        self.call("up", Some(json!({ "interface": interface }))).await?;
        Ok(())
    }

    async fn down(&self, interface: &str) -> Result<()> {
        self.call("down", Some(json!({ "interface": interface }))).await?;
        Ok(())
    }

    async fn route_add_default(&self, interface: &str, gateway: IpAddr) -> Result<()> {
        self.call(
            "routeAddDefault",
            Some(json!({ "interface": interface, "gateway": gateway.to_string() })),
        )
        .await?;
        Ok(())
    }

    async fn configure_dns(
        &self,
        nameservers: &[IpAddr],
        domain: Option<&str>,
        search: &[String],
        options: &[String],
        location: &str,
    ) -> Result<()> {
        let nameservers: Vec<String> = nameservers.iter().map(|ip| ip.to_string()).collect();
        self.call(
            "configureDNS",
            Some(json!({
                "nameservers": nameservers,
                "domain": domain,
                "search": search,
                "options": options,
                "location": location,
            })),
        )
        .await?;
        Ok(())
    }

    async fn standard_setup(&self) -> Result<()> {
        self.call("standardSetup", None).await?;
        Ok(())
    }

    async fn set_time(&self, sec: i64, usec: i64) -> Result<()> {
        self.call("setTime", Some(json!({ "sec": sec, "usec": usec })))
            .await?;
        Ok(())
    }

    async fn getenv(&self, key: &str) -> Result<Option<String>> {
        let result = self.call("getenv", Some(json!({ "key": key }))).await?;
        Ok(result.as_str().map(|s| s.to_string()))
    }

    async fn setenv(&self, key: &str, value: &str) -> Result<()> {
        self.call("setenv", Some(json!({ "key": key, "value": value })))
            .await?;
        Ok(())
    }

    async fn kill(&self, pid: i32, signal: i32) -> Result<()> {
        self.call("kill", Some(json!({ "pid": pid, "signal": signal })))
            .await?;
        Ok(())
    }

    fn supports_socket_relay(&self) -> bool {
        self.capabilities.contains("SocketRelayAgent")
    }

    async fn relay_socket(&self, port: u32, configuration: &Value) -> Result<()> {
        self.require_socket_relay()?;
        self.call(
            "relaySocket",
            Some(json!({ "port": port, "configuration": configuration })),
        )
        .await?;
        Ok(())
    }

    async fn stop_socket_relay(&self, configuration: &Value) -> Result<()> {
        self.require_socket_relay()?;
        self.call("stopSocketRelay", Some(json!({ "configuration": configuration })))
            .await?;
        Ok(())
    }
}

/// A scriptable, in-process [`AgentClient`] for state-machine tests: records
/// every call it receives and, once armed via [`FakeAgentClient::fail_once`],
/// fails the next call to a given method instead of returning its default.
#[cfg(test)]
pub(crate) struct FakeAgentClient {
    calls: Mutex<Vec<String>>,
    failures: Mutex<HashMap<String, String>>,
    relay_support: bool,
}

#[cfg(test)]
impl FakeAgentClient {
    pub(crate) fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            relay_support: true,
        }
    }

    /// Arms `method` to fail its next call with an internal error carrying
    /// `message`.
    pub(crate) async fn fail_once(&self, method: &str, message: &str) {
        self.failures
            .lock()
            .await
            .insert(method.to_string(), message.to_string());
    }

    pub(crate) async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }

    async fn record(&self, method: &str) -> Result<()> {
        self.calls.lock().await.push(method.to_string());
        if let Some(message) = self.failures.lock().await.remove(method) {
            return Err(Error::internal(message));
        }
        Ok(())
    }
}

#[cfg(test)]
#[async_trait::async_trait]
impl AgentClient for FakeAgentClient {
    async fn create_process(
        &self,
        _id: &str,
        _container_id: Option<&str>,
        _stdin_port: Option<u32>,
        _stdout_port: Option<u32>,
        _stderr_port: Option<u32>,
        _spec: &OciProcess,
        _options: Option<Value>,
    ) -> Result<()> {
        self.record("create_process").await
    }

    async fn start_process(&self, _id: &str) -> Result<i32> {
        self.record("start_process").await?;
        Ok(1234)
    }

    async fn signal_process(&self, _id: &str, _signal: i32) -> Result<()> {
        self.record("signal_process").await
    }

    async fn resize_process(&self, _id: &str, _cols: u16, _rows: u16) -> Result<()> {
        self.record("resize_process").await
    }

    async fn wait_process(&self, _id: &str, _timeout: Option<Duration>) -> Result<i32> {
        self.record("wait_process").await?;
        Ok(0)
    }

    async fn delete_process(&self, _id: &str) -> Result<()> {
        self.record("delete_process").await
    }

    async fn mount(&self, _fs: &AttachedFilesystem) -> Result<()> {
        self.record("mount").await
    }

    async fn umount(&self, _path: &str, _flags: u32) -> Result<()> {
        self.record("umount").await
    }

    async fn mkdir(&self, _path: &str, _recursive: bool, _perms: u32) -> Result<()> {
        self.record("mkdir").await
    }

    async fn set_hostname(&self, _hostname: &str) -> Result<()> {
        self.record("set_hostname").await
    }

    async fn address_add(&self, _interface: &str, _address: &str) -> Result<()> {
        self.record("address_add").await
    }

    async fn up(&self, _interface: &str) -> Result<()> {
        self.record("up").await
    }

    async fn down(&self, _interface: &str) -> Result<()> {
        self.record("down").await
    }

    async fn route_add_default(&self, _interface: &str, _gateway: IpAddr) -> Result<()> {
        self.record("route_add_default").await
    }

    async fn configure_dns(
        &self,
        _nameservers: &[IpAddr],
        _domain: Option<&str>,
        _search: &[String],
        _options: &[String],
        _location: &str,
    ) -> Result<()> {
        self.record("configure_dns").await
    }

    async fn standard_setup(&self) -> Result<()> {
        self.record("standard_setup").await
    }

    async fn set_time(&self, _sec: i64, _usec: i64) -> Result<()> {
        self.record("set_time").await
    }

    async fn getenv(&self, _key: &str) -> Result<Option<String>> {
        self.record("getenv").await?;
        Ok(None)
    }

    async fn setenv(&self, _key: &str, _value: &str) -> Result<()> {
        self.record("setenv").await
    }

    async fn kill(&self, _pid: i32, _signal: i32) -> Result<()> {
        self.record("kill").await
    }

    fn supports_socket_relay(&self) -> bool {
        self.relay_support
    }

    async fn relay_socket(&self, _port: u32, _configuration: &Value) -> Result<()> {
        self.record("relay_socket").await
    }

    async fn stop_socket_relay(&self, _configuration: &Value) -> Result<()> {
        self.record("stop_socket_relay").await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn maps_known_rpc_error_codes() {
        let err = map_rpc_error(RpcError {
            code: "Unsupported".into(),
            message: "no such capability".into(),
        });
        assert!(matches!(err.code(), ErrorCode::Unsupported));
    }

    #[test]
    fn unknown_rpc_error_code_maps_to_internal() {
        let err = map_rpc_error(RpcError {
            code: "WhatIsThis".into(),
            message: "?".into(),
        });
        assert!(matches!(err.code(), ErrorCode::InternalError));
    }

    #[tokio::test]
    async fn fake_agent_client_records_calls_and_fails_once() {
        let agent = FakeAgentClient::new();
        agent.set_hostname("box").await.unwrap();
        assert_eq!(agent.calls().await, vec!["set_hostname".to_string()]);

        agent.fail_once("mkdir", "no space").await;
        let err = agent.mkdir("/rootfs", true, 0o755).await.unwrap_err();
        assert!(err.to_string().contains("no space"));
        // the failure is one-shot: the next call succeeds.
        agent.mkdir("/rootfs", true, 0o755).await.unwrap();
    }
}
