//! The container lifecycle state machine (§4.3): `initialized -> creating
//! -> created -> starting -> started -> stopping -> stopped`, with
//! `errored` reachable from any state on unrecoverable failure. Each
//! container holds one state record behind a single mutex; critical
//! sections stay short and never hold the lock across an `.await` (§5).

use std::sync::Arc;
use std::time::Duration;

use oci_spec::runtime::Process as OciProcess;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;

use crate::agent::{AgentClient, RpcAgentClient};
use crate::container::config::VmConfig;
use crate::container::process::LinuxProcess;
use crate::error::{Error, Result};
use crate::mount_planner::{AttachedFilesystem, KernelCmdline, Mount, MountPlanner};
use crate::relay::{RelayRegistry, RelaySpec, UnixSocketRelay};
use crate::stdio::PendingStdio;
use crate::vsock::VsockPortAllocator;
use crate::vsock::VsockTransport;

/// A booted VM, however the host actually materializes one. Left abstract
/// so this crate doesn't have to depend directly on a hypervisor SDK.
#[async_trait::async_trait]
pub trait Vm: Send + Sync {
    async fn boot(&self) -> Result<()>;
    async fn stop(&self) -> Result<()>;
    fn cid(&self) -> u32;
    fn is_stopped(&self) -> bool;
}

/// Materializes a [`Vm`] from a container's [`VmConfig`] plus its planned
/// attached filesystems and composed kernel command line.
#[async_trait::async_trait]
pub trait VmManager: Send + Sync {
    async fn create_vm(
        &self,
        config: &VmConfig,
        root: &AttachedFilesystem,
        mounts: &[AttachedFilesystem],
        cmdline: &str,
    ) -> Result<Box<dyn Vm>>;
}

/// Dials the guest agent once its vsock CID is known. A seam over
/// [`RpcAgentClient::connect`] so tests can hand a container a fake agent
/// without speaking the wire protocol.
#[async_trait::async_trait]
pub trait AgentConnector: Send + Sync {
    async fn connect(&self, cid: u32) -> Result<Arc<dyn AgentClient>>;
}

/// The real connector: dials the agent's well-known vsock port, retrying
/// while the guest's agent hasn't started listening yet.
struct VsockAgentConnector {
    transport: Arc<dyn VsockTransport>,
}

impl VsockAgentConnector {
    fn new(transport: Arc<dyn VsockTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait::async_trait]
impl AgentConnector for VsockAgentConnector {
    async fn connect(&self, cid: u32) -> Result<Arc<dyn AgentClient>> {
        const ATTEMPTS: u32 = 150;
        const RETRY_DELAY: Duration = Duration::from_millis(20);
        let mut last_err = None;
        for _ in 0..ATTEMPTS {
            match RpcAgentClient::connect(self.transport.as_ref(), cid, Default::default()).await {
                Ok(client) => return Ok(Arc::new(client)),
                Err(e) => {
                    last_err = Some(e);
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::internal("agent never became reachable")))
    }
}

/// Agent-side relay teardown (best effort) followed by closing the host
/// side of each relay.
async fn stop_relays(agent: Option<&dyn AgentClient>, relays: Vec<UnixSocketRelay>) {
    if let Some(agent) = agent {
        for relay in &relays {
            if agent.supports_socket_relay() {
                let configuration = Value::String(relay.id().to_string());
                if let Err(e) = agent.stop_socket_relay(&configuration).await {
                    tracing::debug!("agent-side stop for relay {} failed: {e}", relay.id());
                }
            }
        }
    }
    for relay in relays {
        relay.stop().await;
    }
}

/// Stops whatever a failed `create()`/`start()` had already brought up:
/// relays, then the VM itself. Failures here are logged, not propagated —
/// the caller is already unwinding a different error.
async fn stop_vm_and_relays(vm: &dyn Vm, agent: Option<&dyn AgentClient>, relays: Vec<UnixSocketRelay>) {
    stop_relays(agent, relays).await;
    if vm.is_stopped() {
        return;
    }
    if let Err(e) = vm.stop().await {
        tracing::warn!("stopping vm after failed create/start failed: {e}");
    }
}

/// The externally-visible lifecycle phase, without the resources each
/// phase carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Initialized,
    Creating,
    Created,
    Starting,
    Started,
    Stopping,
    Stopped,
    Errored,
}

impl ContainerStatus {
    fn name(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Creating => "creating",
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Started => "started",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Errored => "errored",
        }
    }
}

struct CreatedResources {
    vm: Box<dyn Vm>,
    agent: Arc<dyn AgentClient>,
    relays: Vec<UnixSocketRelay>,
}

struct StartedResources {
    vm: Box<dyn Vm>,
    agent: Arc<dyn AgentClient>,
    relays: Vec<UnixSocketRelay>,
    process: LinuxProcess,
}

enum State {
    Initialized,
    Creating,
    Created(CreatedResources),
    Starting,
    Started(StartedResources),
    Stopping,
    Stopped,
    Errored(String),
}

impl State {
    fn status(&self) -> ContainerStatus {
        match self {
            State::Initialized => ContainerStatus::Initialized,
            State::Creating => ContainerStatus::Creating,
            State::Created(_) => ContainerStatus::Created,
            State::Starting => ContainerStatus::Starting,
            State::Started(_) => ContainerStatus::Started,
            State::Stopping => ContainerStatus::Stopping,
            State::Stopped => ContainerStatus::Stopped,
            State::Errored(_) => ContainerStatus::Errored,
        }
    }
}

/// One container's VM, agent connection, relays and (once started) main
/// process.
pub struct Container {
    pub id: String,
    rootfs: Mount,
    vm_config: VmConfig,
    relay_specs: Vec<RelaySpec>,
    vm_manager: Arc<dyn VmManager>,
    transport: Arc<dyn VsockTransport>,
    agent_connector: Arc<dyn AgentConnector>,
    ports: VsockPortAllocator,
    relay_registry: RelayRegistry,
    state: Mutex<Option<State>>,
}

impl Container {
    pub fn new(
        id: impl Into<String>,
        rootfs: Mount,
        vm_config: VmConfig,
        relay_specs: Vec<RelaySpec>,
        vm_manager: Arc<dyn VmManager>,
        transport: Arc<dyn VsockTransport>,
    ) -> Self {
        let agent_connector = Arc::new(VsockAgentConnector::new(transport.clone()));
        Self::new_with_agent_connector(
            id,
            rootfs,
            vm_config,
            relay_specs,
            vm_manager,
            transport,
            agent_connector,
        )
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub(crate) fn new_with_agent_connector(
        id: impl Into<String>,
        rootfs: Mount,
        vm_config: VmConfig,
        relay_specs: Vec<RelaySpec>,
        vm_manager: Arc<dyn VmManager>,
        transport: Arc<dyn VsockTransport>,
        agent_connector: Arc<dyn AgentConnector>,
    ) -> Self {
        Self {
            id: id.into(),
            rootfs,
            vm_config,
            relay_specs,
            vm_manager,
            transport,
            agent_connector,
            ports: VsockPortAllocator::new(),
            relay_registry: RelayRegistry::new(),
            state: Mutex::new(Some(State::Initialized)),
        }
    }

    pub async fn status(&self) -> ContainerStatus {
        self.state
            .lock()
            .await
            .as_ref()
            .expect("container state missing")
            .status()
    }

    /// Takes the current state out, handing it to `f`. If `f` rejects it
    /// (state mismatch), the original state is restored and a
    /// `invalid_state` error naming `operation`/`required` is returned.
    async fn leave_state<T>(
        &self,
        operation: &str,
        required: &str,
        f: impl FnOnce(State) -> std::result::Result<(State, T), State>,
    ) -> Result<T> {
        let mut guard = self.state.lock().await;
        let current = guard.take().expect("container state missing");
        let actual = current.status();
        match f(current) {
            Ok((next, value)) => {
                *guard = Some(next);
                Ok(value)
            }
            Err(restored) => {
                *guard = Some(restored);
                Err(Error::invalid_state(operation, required, actual.name()))
            }
        }
    }

    async fn enter_state(&self, state: State) {
        *self.state.lock().await = Some(state);
    }

    /// Runs §4.3's `create()`: materializes and boots the VM, waits for the
    /// agent, runs standard setup, mounts the container's rootfs, starts
    /// configured relays, and brings up networking/DNS.
    pub async fn create(&self) -> Result<()> {
        self.leave_state("create", "initialized", |s| match s {
            State::Initialized => Ok((State::Creating, ())),
            other => Err(other),
        })
        .await?;

        match self.do_create().await {
            Ok(resources) => {
                self.enter_state(State::Created(resources)).await;
                Ok(())
            }
            Err(e) => {
                self.enter_state(State::Errored(e.to_string())).await;
                Err(e)
            }
        }
    }

    /// Boots the VM, then runs [`Container::finish_create`]. On any failure
    /// after the VM exists, stops it (and whatever relays got started)
    /// before surfacing the original error, per the lifecycle contract.
    async fn do_create(&self) -> Result<CreatedResources> {
        let mut planner = MountPlanner::new();
        let (root_attached, other_attached) = planner.plan(&self.rootfs, &self.vm_config.mounts);

        let initfs_type = KernelCmdline::parse_initfs_type(&self.vm_config.kernel.initfs_type)?;
        let cmdline = KernelCmdline::compose(
            &self.vm_config.kernel.args,
            initfs_type,
            &root_attached.source,
            &[],
        )?;

        let vm = self
            .vm_manager
            .create_vm(&self.vm_config, &root_attached, &other_attached, &cmdline)
            .await?;
        if let Err(e) = vm.boot().await {
            stop_vm_and_relays(vm.as_ref(), None, Vec::new()).await;
            return Err(e);
        }

        let mut agent: Option<Arc<dyn AgentClient>> = None;
        let mut relays = Vec::with_capacity(self.relay_specs.len());
        match self
            .finish_create(&root_attached, vm.as_ref(), &mut agent, &mut relays)
            .await
        {
            Ok(()) => Ok(CreatedResources {
                vm,
                agent: agent.expect("finish_create only succeeds after setting the agent"),
                relays,
            }),
            Err(e) => {
                stop_vm_and_relays(vm.as_ref(), agent.as_deref(), relays).await;
                Err(e)
            }
        }
    }

    /// Everything `do_create` does once the VM is booted: connect the
    /// agent, run its standard setup, write the hostname, mount the rootfs,
    /// start relays, and bring up networking/DNS. `agent_out` is set as
    /// soon as the agent connects so a caller that sees this fail still has
    /// a handle to close it; `relays` accumulates as each one starts.
    async fn finish_create(
        &self,
        root_attached: &AttachedFilesystem,
        vm: &dyn Vm,
        agent_out: &mut Option<Arc<dyn AgentClient>>,
        relays: &mut Vec<UnixSocketRelay>,
    ) -> Result<()> {
        let agent = self.agent_connector.connect(vm.cid()).await?;
        *agent_out = Some(agent.clone());
        agent.standard_setup().await?;

        if let Some(hostname) = &self.vm_config.hostname {
            agent.set_hostname(hostname).await?;
        }

        let rootfs_path = format!("/run/container/{}/rootfs", self.id);
        agent.mkdir(&rootfs_path, true, 0o755).await?;
        agent
            .mount(&AttachedFilesystem {
                kind: root_attached.kind.clone(),
                source: root_attached.source.clone(),
                destination: rootfs_path,
                options: root_attached.options.clone(),
            })
            .await?;

        for spec in &self.relay_specs {
            let relay = self
                .relay_registry
                .start(
                    spec.clone(),
                    self.transport.clone(),
                    self.ports.clone(),
                    vm.cid(),
                )
                .await?;
            relays.push(relay);
        }

        for (i, interface) in self.vm_config.interfaces.iter().enumerate() {
            let name = format!("eth{i}");
            agent
                .address_add(&name, &interface.address.to_string())
                .await?;
            agent.up(&name).await?;
            if let Some(gateway) = interface.gateway {
                agent.route_add_default(&name, gateway).await?;
            }
        }

        if let Some(dns) = &self.vm_config.dns {
            agent
                .configure_dns(
                    &dns.nameservers,
                    dns.domain.as_deref(),
                    &dns.search,
                    &dns.options,
                    "/etc/resolv.conf",
                )
                .await?;
        }

        Ok(())
    }

    /// §4.3's `start()`: allocates stdio ports, asks the agent to create
    /// the process, waits (bounded to 3s) for the guest to connect its
    /// stdio streams back, then starts it.
    #[allow(clippy::too_many_arguments)]
    pub async fn start(
        &self,
        process_id: &str,
        spec: &OciProcess,
        stdin: Option<Box<dyn AsyncRead + Send + Unpin>>,
        stdout: Option<Box<dyn AsyncWrite + Send + Unpin>>,
        stderr: Option<Box<dyn AsyncWrite + Send + Unpin>>,
        terminal: bool,
        options: Option<Value>,
    ) -> Result<i32> {
        let created = self
            .leave_state("start", "created", |s| match s {
                State::Created(resources) => Ok((State::Starting, resources)),
                other => Err(other),
            })
            .await?;

        match self
            .do_start(process_id, spec, stdin, stdout, stderr, terminal, options, created)
            .await
        {
            Ok((pid, started)) => {
                self.enter_state(State::Started(started)).await;
                Ok(pid)
            }
            Err((e, created)) => {
                let CreatedResources { vm, agent, relays } = created;
                stop_vm_and_relays(vm.as_ref(), Some(agent.as_ref()), relays).await;
                self.enter_state(State::Errored(e.to_string())).await;
                Err(e)
            }
        }
    }

    /// On any failure, hands `created` back unchanged alongside the error so
    /// the caller can stop the VM and release the agent/relays it already
    /// built, instead of orphaning them.
    #[allow(clippy::too_many_arguments)]
    async fn do_start(
        &self,
        process_id: &str,
        spec: &OciProcess,
        stdin: Option<Box<dyn AsyncRead + Send + Unpin>>,
        stdout: Option<Box<dyn AsyncWrite + Send + Unpin>>,
        stderr: Option<Box<dyn AsyncWrite + Send + Unpin>>,
        terminal: bool,
        options: Option<Value>,
        created: CreatedResources,
    ) -> std::result::Result<(i32, StartedResources), (Error, CreatedResources)> {
        let CreatedResources { vm, agent, relays } = created;

        let (pending, ports) = match PendingStdio::listen(
            self.transport.as_ref(),
            &self.ports,
            stdin,
            stdout,
            stderr,
            terminal,
        )
        .await
        {
            Ok(v) => v,
            Err(e) => return Err((e, CreatedResources { vm, agent, relays })),
        };

        if let Err(e) = agent
            .create_process(
                process_id,
                Some(&self.id),
                ports.stdin,
                ports.stdout,
                ports.stderr,
                spec,
                options,
            )
            .await
        {
            return Err((e, CreatedResources { vm, agent, relays }));
        }

        let stdio = match pending.accept(Duration::from_secs(3)).await {
            Ok(s) => s,
            Err(e) => {
                agent.delete_process(process_id).await.ok();
                return Err((e, CreatedResources { vm, agent, relays }));
            }
        };

        let pid = match agent.start_process(process_id).await {
            Ok(pid) => pid,
            Err(e) => {
                agent.delete_process(process_id).await.ok();
                return Err((e, CreatedResources { vm, agent, relays }));
            }
        };

        let process = LinuxProcess::new(process_id.to_string(), pid, agent.clone(), Some(stdio));

        Ok((
            pid,
            StartedResources {
                vm,
                agent,
                relays,
                process,
            },
        ))
    }

    async fn with_started<T>(
        &self,
        operation: &str,
        f: impl FnOnce(&StartedResources) -> Result<T>,
    ) -> Result<T> {
        let guard = self.state.lock().await;
        match guard.as_ref().expect("container state missing") {
            State::Started(resources) => f(resources),
            other => Err(Error::invalid_state(operation, "started", other.status().name())),
        }
    }

    pub async fn kill(&self, signal: i32) -> Result<()> {
        let agent = self
            .with_started("kill", |r| Ok(r.process.agent_handle()))
            .await?;
        agent.signal_process(&self.process_id().await?, signal).await
    }

    pub async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let (agent, id) = self
            .with_started("resize", |r| Ok((r.process.agent_handle(), r.process.id.clone())))
            .await?;
        agent.resize_process(&id, cols, rows).await
    }

    pub async fn wait(&self, timeout: Option<Duration>) -> Result<i32> {
        let (agent, id) = self
            .with_started("wait", |r| Ok((r.process.agent_handle(), r.process.id.clone())))
            .await?;
        agent.wait_process(&id, timeout).await
    }

    async fn process_id(&self) -> Result<String> {
        self.with_started("kill", |r| Ok(r.process.id.clone())).await
    }

    /// Runs a secondary process inside an already-started container. The
    /// returned handle is independent of the container's main process.
    #[allow(clippy::too_many_arguments)]
    pub async fn exec(
        &self,
        exec_id: &str,
        spec: &OciProcess,
        stdin: Option<Box<dyn AsyncRead + Send + Unpin>>,
        stdout: Option<Box<dyn AsyncWrite + Send + Unpin>>,
        stderr: Option<Box<dyn AsyncWrite + Send + Unpin>>,
        terminal: bool,
        options: Option<Value>,
    ) -> Result<LinuxProcess> {
        let agent = self
            .with_started("exec", |r| Ok(r.process.agent_handle()))
            .await?;

        let (pending, ports) = PendingStdio::listen(
            self.transport.as_ref(),
            &self.ports,
            stdin,
            stdout,
            stderr,
            terminal,
        )
        .await?;
        agent
            .create_process(
                exec_id,
                Some(&self.id),
                ports.stdin,
                ports.stdout,
                ports.stderr,
                spec,
                options,
            )
            .await?;
        let stdio = pending.accept(Duration::from_secs(3)).await?;
        let pid = agent.start_process(exec_id).await?;
        Ok(LinuxProcess::new(exec_id.to_string(), pid, agent, Some(stdio)))
    }

    /// §4.3's `stop()`: stops relays (agent side first, to avoid `EBUSY` on
    /// rootfs umount), kills and reaps the init process, unmounts the
    /// rootfs, then stops the VM.
    pub async fn stop(&self) -> Result<()> {
        let started = self
            .leave_state("stop", "started", |s| match s {
                State::Started(resources) => Ok((State::Stopping, resources)),
                other => Err(other),
            })
            .await?;

        match self.do_stop(started).await {
            Ok(()) => {
                self.enter_state(State::Stopped).await;
                Ok(())
            }
            Err(e) => {
                self.enter_state(State::Errored(e.to_string())).await;
                Err(e)
            }
        }
    }

    async fn do_stop(&self, started: StartedResources) -> Result<()> {
        let StartedResources {
            vm,
            agent,
            relays,
            process,
        } = started;

        stop_relays(Some(agent.as_ref()), relays).await;

        if vm.is_stopped() {
            return Ok(());
        }

        let process_id = process.id.clone();
        process.delete().await.ok();
        agent.kill(-1, libc::SIGKILL).await?;
        agent
            .wait_process(&process_id, Some(Duration::from_secs(5)))
            .await
            .ok();
        let rootfs_path = format!("/run/container/{}/rootfs", self.id);
        agent.umount(&rootfs_path, 0).await?;

        vm.stop().await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::agent::FakeAgentClient;
    use crate::mount_planner::MountRuntimeOptions;
    use crate::vsock::InMemoryVsockTransport;

    struct FakeVm {
        cid: u32,
        stopped: Arc<AtomicBool>,
        fail_boot: bool,
    }

    #[async_trait::async_trait]
    impl Vm for FakeVm {
        async fn boot(&self) -> Result<()> {
            if self.fail_boot {
                return Err(Error::internal("boot failed"));
            }
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn cid(&self) -> u32 {
            self.cid
        }

        fn is_stopped(&self) -> bool {
            self.stopped.load(Ordering::SeqCst)
        }
    }

    /// Hands out one [`FakeVm`] per `create_vm` call, all sharing `stopped`
    /// so the test can observe whether the container stopped it.
    struct FakeVmManager {
        stopped: Arc<AtomicBool>,
        fail_boot: bool,
    }

    #[async_trait::async_trait]
    impl VmManager for FakeVmManager {
        async fn create_vm(
            &self,
            _config: &VmConfig,
            _root: &AttachedFilesystem,
            _mounts: &[AttachedFilesystem],
            _cmdline: &str,
        ) -> Result<Box<dyn Vm>> {
            Ok(Box::new(FakeVm {
                cid: 3,
                stopped: self.stopped.clone(),
                fail_boot: self.fail_boot,
            }))
        }
    }

    struct FakeAgentConnector {
        agent: Arc<FakeAgentClient>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl AgentConnector for FakeAgentConnector {
        async fn connect(&self, _cid: u32) -> Result<Arc<dyn AgentClient>> {
            if self.fail {
                return Err(Error::internal("agent never became reachable"));
            }
            Ok(self.agent.clone())
        }
    }

    fn test_mount() -> Mount {
        Mount {
            kind: "ext4".to_string(),
            source: "rootfs".to_string(),
            destination: "/".to_string(),
            options: Vec::new(),
            runtime_options: MountRuntimeOptions::BlockDevice(vec!["vda".to_string()]),
        }
    }

    /// Routes `tracing` output (the `stop_vm_and_relays`/`leave_state`
    /// warnings this module logs on a botched cleanup) through the test
    /// harness instead of stdout. Idempotent: later calls across tests in
    /// this process are no-ops.
    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    fn new_test_container(
        vm_manager: Arc<dyn VmManager>,
        agent_connector: Arc<dyn AgentConnector>,
        vm_config: VmConfig,
    ) -> Container {
        Container::new_with_agent_connector(
            "test-container",
            test_mount(),
            vm_config,
            Vec::new(),
            vm_manager,
            Arc::new(InMemoryVsockTransport::new()),
            agent_connector,
        )
    }

    #[tokio::test]
    async fn create_then_start_reaches_started() {
        init_tracing();
        let stopped = Arc::new(AtomicBool::new(false));
        let vm_manager = Arc::new(FakeVmManager {
            stopped: stopped.clone(),
            fail_boot: false,
        });
        let agent = Arc::new(FakeAgentClient::new());
        let connector = Arc::new(FakeAgentConnector {
            agent: agent.clone(),
            fail: false,
        });
        let container = new_test_container(vm_manager, connector, VmConfig::default());

        container.create().await.unwrap();
        assert_eq!(container.status().await, ContainerStatus::Created);
        assert!(agent.calls().await.contains(&"standard_setup".to_string()));
        assert!(agent.calls().await.contains(&"mount".to_string()));
        assert!(!stopped.load(Ordering::SeqCst));

        let pid = container
            .start(
                "init",
                &OciProcess::default(),
                None,
                None,
                None,
                false,
                None,
            )
            .await
            .unwrap();
        assert_eq!(pid, 1234);
        assert_eq!(container.status().await, ContainerStatus::Started);
    }

    #[tokio::test]
    async fn create_writes_hostname_when_configured() {
        init_tracing();
        let stopped = Arc::new(AtomicBool::new(false));
        let vm_manager = Arc::new(FakeVmManager {
            stopped,
            fail_boot: false,
        });
        let agent = Arc::new(FakeAgentClient::new());
        let connector = Arc::new(FakeAgentConnector {
            agent: agent.clone(),
            fail: false,
        });
        let mut vm_config = VmConfig::default();
        vm_config.hostname = Some("sandbox".to_string());
        let container = new_test_container(vm_manager, connector, vm_config);

        container.create().await.unwrap();
        assert!(agent.calls().await.contains(&"set_hostname".to_string()));
    }

    #[tokio::test]
    async fn create_without_hostname_never_calls_set_hostname() {
        init_tracing();
        let stopped = Arc::new(AtomicBool::new(false));
        let vm_manager = Arc::new(FakeVmManager {
            stopped,
            fail_boot: false,
        });
        let agent = Arc::new(FakeAgentClient::new());
        let connector = Arc::new(FakeAgentConnector {
            agent: agent.clone(),
            fail: false,
        });
        let container = new_test_container(vm_manager, connector, VmConfig::default());

        container.create().await.unwrap();
        assert!(!agent.calls().await.contains(&"set_hostname".to_string()));
    }

    /// The regression test for the cleanup bug: a failure deep inside
    /// `finish_create` (after the VM booted and the agent connected) must
    /// still stop the VM rather than orphaning it.
    #[tokio::test]
    async fn failed_create_stops_the_vm_it_already_booted() {
        init_tracing();
        let stopped = Arc::new(AtomicBool::new(false));
        let vm_manager = Arc::new(FakeVmManager {
            stopped: stopped.clone(),
            fail_boot: false,
        });
        let agent = Arc::new(FakeAgentClient::new());
        agent.fail_once("mount", "no such device").await;
        let connector = Arc::new(FakeAgentConnector {
            agent: agent.clone(),
            fail: false,
        });
        let container = new_test_container(vm_manager, connector, VmConfig::default());

        let err = container.create().await.unwrap_err();
        assert!(err.to_string().contains("no such device"));
        assert!(stopped.load(Ordering::SeqCst), "vm should have been stopped on create failure");
        assert_eq!(container.status().await, ContainerStatus::Errored);
    }

    #[tokio::test]
    async fn failed_agent_connect_still_stops_the_booted_vm() {
        init_tracing();
        let stopped = Arc::new(AtomicBool::new(false));
        let vm_manager = Arc::new(FakeVmManager {
            stopped: stopped.clone(),
            fail_boot: false,
        });
        let agent = Arc::new(FakeAgentClient::new());
        let connector = Arc::new(FakeAgentConnector { agent, fail: true });
        let container = new_test_container(vm_manager, connector, VmConfig::default());

        assert!(container.create().await.is_err());
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn failed_vm_boot_never_reaches_finish_create() {
        init_tracing();
        let stopped = Arc::new(AtomicBool::new(false));
        let vm_manager = Arc::new(FakeVmManager {
            stopped,
            fail_boot: true,
        });
        let agent = Arc::new(FakeAgentClient::new());
        let connector = Arc::new(FakeAgentConnector {
            agent: agent.clone(),
            fail: false,
        });
        let container = new_test_container(vm_manager, connector, VmConfig::default());

        assert!(container.create().await.is_err());
        assert!(agent.calls().await.is_empty());
    }

    /// The same regression, but for `start()`: a failure after the agent
    /// already accepted `createProcess` must still release the VM and
    /// agent built during the earlier successful `create()`.
    #[tokio::test]
    async fn failed_start_stops_the_vm_from_the_prior_create() {
        init_tracing();
        let stopped = Arc::new(AtomicBool::new(false));
        let vm_manager = Arc::new(FakeVmManager {
            stopped: stopped.clone(),
            fail_boot: false,
        });
        let agent = Arc::new(FakeAgentClient::new());
        let connector = Arc::new(FakeAgentConnector {
            agent: agent.clone(),
            fail: false,
        });
        let container = new_test_container(vm_manager, connector, VmConfig::default());
        container.create().await.unwrap();

        agent.fail_once("start_process", "agent rejected startProcess").await;
        let err = container
            .start(
                "init",
                &OciProcess::default(),
                None,
                None,
                None,
                false,
                None,
            )
            .await
            .unwrap_err();

        assert!(err.to_string().contains("agent rejected startProcess"));
        assert!(stopped.load(Ordering::SeqCst), "vm should have been stopped on start failure");
        assert_eq!(container.status().await, ContainerStatus::Errored);
    }

    #[tokio::test]
    async fn start_before_create_is_an_invalid_state_error() {
        init_tracing();
        let stopped = Arc::new(AtomicBool::new(false));
        let vm_manager = Arc::new(FakeVmManager {
            stopped,
            fail_boot: false,
        });
        let agent = Arc::new(FakeAgentClient::new());
        let connector = Arc::new(FakeAgentConnector { agent, fail: false });
        let container = new_test_container(vm_manager, connector, VmConfig::default());

        let err = container
            .start(
                "init",
                &OciProcess::default(),
                None,
                None,
                None,
                false,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err.code(), crate::error::ErrorCode::InvalidState));
    }
}
