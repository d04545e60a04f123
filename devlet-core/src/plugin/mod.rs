//! The shared device-plugin runtime.
//!
//! Every device class (PCI, mediated, USB, generic, socket) embeds the same
//! `PluginRuntime`: it owns the plugin's listening socket, the registration
//! handshake with the node agent, the device list served over `ListAndWatch`
//! and the health-check loop. Class-specific behavior is injected as
//! function-valued fields in [`DevicePluginOps`] rather than through
//! subclassing, so a class constructor is nothing more than a capability
//! table plus a discovered device list.

use crate::error::{DevletError, Result};
use crate::observability::metrics as obs;
use devlet_api::deviceplugin::v1beta1 as api;
use devlet_api::deviceplugin::v1beta1::device_plugin_server::{DevicePlugin, DevicePluginServer};
use devlet_api::deviceplugin::v1beta1::registration_client::RegistrationClient;
use devlet_api::{API_VERSION, HEALTHY, UNHEALTHY};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{ReceiverStream, UnixListenerStream};
use tokio_stream::Stream;
use tonic::transport::{Endpoint, Server, Uri};
use tonic::{Request, Response, Status};
use tower::service_fn;
use tracing::{info, instrument, warn};

pub mod health;

use health::{HealthMonitor, MonitoredDevices};

/// Namespace prefix of the resource names devlet advertises.
pub const DEVICE_NAMESPACE: &str = "devices.devlet.io";

/// How long to wait for the plugin's own gRPC socket to become connectable
/// and for the dial to the node agent's registration socket.
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `stop` waits for the node agent to consume the final empty
/// device list before force-stopping the server.
const DEREGISTRATION_TIMEOUT: Duration = Duration::from_secs(1);

pub type AllocateFn =
    Box<dyn Fn(&api::AllocateRequest) -> Result<api::AllocateResponse> + Send + Sync>;
pub type SetupMonitoredDevicesFn =
    Box<dyn Fn(&mut MonitoredDevices) -> Result<()> + Send + Sync>;
pub type SetupFn = Box<dyn Fn() -> Result<()> + Send + Sync>;
pub type DeviceNameFn = Box<dyn Fn(&str) -> String + Send + Sync>;
pub type ConfigurePermissionsFn = Box<dyn Fn(&Path) -> Result<()> + Send + Sync>;
pub type MutateHealthFn = Box<dyn Fn(&str, &Path, bool) -> Result<bool> + Send + Sync>;

/// The capability table a device class injects into the runtime.
pub struct DevicePluginOps {
    /// REQUIRED. Resolve an allocation request into device specs, env vars
    /// and mounts.
    pub allocate: AllocateFn,
    /// REQUIRED. Declare which paths map to which device IDs and which
    /// directories the health monitor must watch. An empty device ID marks a
    /// path that stands for every device of the resource.
    pub setup_monitored_devices: SetupMonitoredDevicesFn,
    /// Optional additional setup run before the socket is bound, e.g.
    /// pre-opening a device node to trigger kernel module autoload.
    pub setup: Option<SetupFn>,
    /// Optional device-id → human-readable name mapping for logs.
    pub device_name_by_id: Option<DeviceNameFn>,
    /// Optional permission fixup run when a monitored device appears; the
    /// device only becomes healthy if the hook succeeds.
    pub configure_permissions: Option<ConfigurePermissionsFn>,
    /// Optional hook rewriting a health verdict before it is published, e.g.
    /// USB group health as the AND of its members.
    pub mutate_health: Option<MutateHealthFn>,
}

/// Where the plugin sockets live and where the host filesystem is mounted.
#[derive(Debug, Clone)]
pub struct PluginPaths {
    /// Directory shared with the node agent; holds the registration socket
    /// and every plugin's own socket.
    pub plugin_dir: PathBuf,
    /// Host filesystem root; device paths are resolved beneath it.
    pub device_root: PathBuf,
}

impl Default for PluginPaths {
    fn default() -> Self {
        Self { plugin_dir: crate::paths::plugin_dir(), device_root: crate::paths::host_root() }
    }
}

impl PluginPaths {
    /// The plugin's own socket, named after the resource.
    pub fn socket_path(&self, resource_name: &str) -> PathBuf {
        self.plugin_dir.join(format!("devlet-{}.sock", resource_id(resource_name)))
    }

    /// The node agent's registration socket.
    pub fn registry_socket(&self) -> PathBuf {
        self.plugin_dir.join(crate::paths::REGISTRY_SOCKET_NAME)
    }

    /// Resolve an absolute host path beneath the device root.
    pub fn host_path(&self, absolute: &Path) -> PathBuf {
        crate::sysfs::host_path(&self.device_root, absolute)
    }
}

/// The trailing path segment of a namespaced resource name.
pub fn resource_id(resource_name: &str) -> String {
    resource_name.rsplit('/').next().unwrap_or(resource_name).to_string()
}

/// Build the wire topology for a sysfs NUMA node (-1 means no affinity).
pub fn topology(numa_node: i32) -> Option<api::TopologyInfo> {
    (numa_node >= 0)
        .then(|| api::TopologyInfo { nodes: vec![api::NumaNode { id: numa_node as i64 }] })
}

struct RunSignals {
    stop: watch::Sender<bool>,
    done: watch::Sender<bool>,
    deregistered: watch::Sender<bool>,
}

impl RunSignals {
    fn new() -> Self {
        Self {
            stop: watch::channel(false).0,
            done: watch::channel(false).0,
            deregistered: watch::channel(false).0,
        }
    }
}

struct HealthChannel {
    tx: mpsc::Sender<()>,
    rx: Option<mpsc::Receiver<()>>,
}

impl HealthChannel {
    fn new() -> Self {
        // Capacity 1: the channel is a level trigger, pending notifications
        // coalesce instead of queueing behind a slow node agent.
        let (tx, rx) = mpsc::channel(1);
        Self { tx, rx: Some(rx) }
    }
}

pub(crate) struct PluginShared {
    pub(crate) resource_name: String,
    pub(crate) socket_path: PathBuf,
    registry_socket: PathBuf,
    pub(crate) ops: DevicePluginOps,
    devices: Mutex<Vec<api::Device>>,
    initialized: Mutex<bool>,
    health: Mutex<HealthChannel>,
    signals: Mutex<RunSignals>,
}

impl PluginShared {
    pub(crate) fn clone_devices(&self) -> Vec<api::Device> {
        // Clone under the lock so a slow ListAndWatch send never blocks the
        // health loop.
        self.devices.lock().unwrap().clone()
    }

    pub(crate) fn device_count(&self) -> usize {
        self.devices.lock().unwrap().len()
    }

    fn set_initialized(&self, initialized: bool) {
        *self.initialized.lock().unwrap() = initialized;
    }

    pub(crate) fn initialized(&self) -> bool {
        *self.initialized.lock().unwrap()
    }

    /// Rewrite the health of one device (or of all devices when `device_id`
    /// is empty) and wake up `ListAndWatch`.
    pub(crate) fn update_device_health(&self, device_id: &str, healthy: bool) {
        let health = if healthy { HEALTHY } else { UNHEALTHY };
        {
            let mut devices = self.devices.lock().unwrap();
            for device in devices.iter_mut() {
                if device_id.is_empty() || device.id == device_id {
                    device.health = health.to_string();
                }
            }
        }
        obs::record_health_transition(&self.resource_name, healthy);
        self.notify_health_update();
    }

    fn notify_health_update(&self) {
        // A pending signal already covers this update.
        let _ = self.health.lock().unwrap().tx.try_send(());
    }

    fn take_health_rx(&self) -> Option<mpsc::Receiver<()>> {
        self.health.lock().unwrap().rx.take()
    }

    pub(crate) fn friendly_name(&self, device_id: &str) -> String {
        if let Some(name_fn) = &self.ops.device_name_by_id {
            return name_fn(device_id);
        }
        if device_id.is_empty() {
            format!("device plugin ({})", self.resource_name)
        } else {
            format!("device plugin ({})", device_id)
        }
    }

    fn reset_run_state(&self) {
        *self.signals.lock().unwrap() = RunSignals::new();
        *self.health.lock().unwrap() = HealthChannel::new();
        self.set_initialized(false);
    }

    pub(crate) fn subscribe_stop(&self) -> watch::Receiver<bool> {
        self.signals.lock().unwrap().stop.subscribe()
    }

    fn subscribe_done(&self) -> watch::Receiver<bool> {
        self.signals.lock().unwrap().done.subscribe()
    }

    fn subscribe_deregistered(&self) -> watch::Receiver<bool> {
        self.signals.lock().unwrap().deregistered.subscribe()
    }

    // send_replace: the mark must stick even when nothing subscribed yet.
    fn mark_stopped(&self) {
        self.signals.lock().unwrap().stop.send_replace(true);
    }

    fn mark_done(&self) {
        self.signals.lock().unwrap().done.send_replace(true);
    }

    fn mark_deregistered(&self) {
        self.signals.lock().unwrap().deregistered.send_replace(true);
    }

    fn cleanup_socket(&self) -> Result<()> {
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DevletError::io(&self.socket_path, e)),
        }
    }
}

/// One running (or startable) device plugin for a single resource name.
pub struct PluginRuntime {
    shared: Arc<PluginShared>,
}

impl PluginRuntime {
    pub fn new(
        resource_name: impl Into<String>,
        devices: Vec<api::Device>,
        ops: DevicePluginOps,
        paths: &PluginPaths,
    ) -> Self {
        let resource_name = resource_name.into();
        let socket_path = paths.socket_path(&resource_name);
        let registry_socket = paths.registry_socket();
        Self {
            shared: Arc::new(PluginShared {
                resource_name,
                socket_path,
                registry_socket,
                ops,
                devices: Mutex::new(devices),
                initialized: Mutex::new(false),
                health: Mutex::new(HealthChannel::new()),
                signals: Mutex::new(RunSignals::new()),
            }),
        }
    }

    pub fn resource_name(&self) -> &str {
        &self.shared.resource_name
    }

    /// True once the plugin is serving and registered with the node agent.
    pub fn initialized(&self) -> bool {
        self.shared.initialized()
    }

    pub fn device_count(&self) -> usize {
        self.shared.device_count()
    }

    pub fn socket_path(&self) -> &Path {
        &self.shared.socket_path
    }

    /// Resolve an allocation request through the class's capability table.
    /// This is the same entry point the gRPC `Allocate` handler uses.
    pub fn allocate(&self, request: &api::AllocateRequest) -> Result<api::AllocateResponse> {
        (self.shared.ops.allocate)(request)
    }

    /// Run the plugin until it fails, the node agent restarts, or `stop`
    /// flips to true. Startup order matters: serve the socket, wait for it
    /// to become connectable, register, then start health monitoring; the
    /// plugin only reports initialized once all of that succeeded.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) -> Result<()> {
        let shared = self.shared.clone();
        shared.reset_run_state();
        shared.cleanup_socket()?;

        if let Some(setup) = &shared.ops.setup {
            setup()?;
        }

        let listener = UnixListener::bind(&shared.socket_path)
            .map_err(|e| DevletError::SocketBind { path: shared.socket_path.clone(), source: e })?;
        let incoming = UnixListenerStream::new(listener);

        let service = PluginService { shared: shared.clone() };
        let shutdown = {
            let mut done = shared.subscribe_done();
            let mut stopped = shared.subscribe_stop();
            async move {
                tokio::select! {
                    _ = done.wait_for(|d| *d) => {}
                    _ = stopped.wait_for(|s| *s) => {}
                }
            }
        };
        let mut server: JoinHandle<std::result::Result<(), tonic::transport::Error>> =
            tokio::spawn(
                Server::builder()
                    .add_service(DevicePluginServer::new(service))
                    .serve_with_incoming_shutdown(incoming, shutdown),
            );

        let monitor = match self.start_up(&shared).await {
            Ok(monitor) => monitor,
            Err(e) => {
                shared.mark_stopped();
                shared.mark_done();
                if tokio::time::timeout(Duration::from_secs(1), &mut server).await.is_err() {
                    server.abort();
                }
                self.finish_run();
                return Err(e);
            }
        };
        let mut health: JoinHandle<Result<()>> = tokio::spawn(monitor.run());

        shared.set_initialized(true);
        obs::record_plugin_started(&shared.resource_name);
        info!(resource = %shared.resource_name, "device plugin started");

        enum ExitReason {
            Server(Result<()>),
            Health(Result<()>),
            Stopped,
        }

        let reason = tokio::select! {
            res = &mut server => ExitReason::Server(match res {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(DevletError::Transport(e)),
                Err(e) => Err(DevletError::Internal(format!("plugin server task failed: {e}"))),
            }),
            res = &mut health => ExitReason::Health(match res {
                // A clean health-loop exit means stop fired or the node
                // agent restarted and discarded the registration; either way
                // this run is over.
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(DevletError::Internal(format!("health task failed: {e}"))),
            }),
            _ = stop.wait_for(|s| *s) => ExitReason::Stopped,
        };

        shared.mark_stopped();
        shared.mark_done();

        // Give the node agent a moment to consume the final empty device
        // list before the socket goes away.
        let mut deregistered = shared.subscribe_deregistered();
        let _ =
            tokio::time::timeout(DEREGISTRATION_TIMEOUT, deregistered.wait_for(|d| *d)).await;

        // The shutdown signal lets the server drain the deregistration
        // update; force it down only if it lingers.
        if !matches!(reason, ExitReason::Server(_))
            && tokio::time::timeout(Duration::from_secs(1), &mut server).await.is_err()
        {
            server.abort();
        }
        if !matches!(reason, ExitReason::Health(_)) {
            health.abort();
        }
        self.finish_run();

        match reason {
            ExitReason::Server(result) => result,
            ExitReason::Health(result) => result,
            ExitReason::Stopped => Ok(()),
        }
    }

    async fn start_up(&self, shared: &Arc<PluginShared>) -> Result<HealthMonitor> {
        wait_for_socket(&shared.socket_path, &shared.resource_name).await?;
        register(shared).await?;
        // Build the health-check context synchronously before marking the
        // plugin initialized so no filesystem event is missed.
        HealthMonitor::new(shared.clone())
    }

    fn finish_run(&self) {
        self.shared.set_initialized(false);
        if let Err(e) = self.shared.cleanup_socket() {
            warn!(resource = %self.shared.resource_name, error = %e, "failed to remove plugin socket");
        }
    }
}

/// Wait until the freshly bound plugin socket accepts connections.
async fn wait_for_socket(path: &Path, resource: &str) -> Result<()> {
    let deadline = tokio::time::Instant::now() + CONNECTION_TIMEOUT;
    loop {
        match UnixStream::connect(path).await {
            Ok(_) => return Ok(()),
            Err(_) if tokio::time::Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(_) => {
                return Err(DevletError::ServerNotReady {
                    resource: resource.to_string(),
                    timeout: CONNECTION_TIMEOUT,
                })
            }
        }
    }
}

/// Announce the plugin to the node agent over its registration socket.
async fn register(shared: &Arc<PluginShared>) -> Result<()> {
    let registry = shared.registry_socket.clone();
    let resource = shared.resource_name.clone();

    // The URI is required by the endpoint builder but unused for Unix sockets
    let channel = Endpoint::try_from("http://[::]:50051")?
        .connect_timeout(CONNECTION_TIMEOUT)
        .connect_with_connector(service_fn(move |_: Uri| {
            let path = registry.clone();
            async move { UnixStream::connect(path).await }
        }))
        .await
        .map_err(|e| DevletError::RegistrationFailed {
            resource: resource.clone(),
            reason: format!("failed to dial the node agent socket: {e}"),
        })?;

    let endpoint = shared
        .socket_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let mut client = RegistrationClient::new(channel);
    client
        .register(api::RegisterRequest {
            version: API_VERSION.to_string(),
            endpoint,
            resource_name: shared.resource_name.clone(),
        })
        .await
        .map_err(|e| DevletError::RegistrationFailed {
            resource: resource.clone(),
            reason: e.to_string(),
        })?;
    Ok(())
}

/// gRPC service implementation
struct PluginService {
    shared: Arc<PluginShared>,
}

#[tonic::async_trait]
impl DevicePlugin for PluginService {
    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = std::result::Result<api::ListAndWatchResponse, Status>> + Send>>;

    #[instrument(skip_all, fields(resource = %self.shared.resource_name))]
    async fn list_and_watch(
        &self,
        _request: Request<api::Empty>,
    ) -> std::result::Result<Response<Self::ListAndWatchStream>, Status> {
        info!("gRPC: ListAndWatch");

        let mut health_rx = self.shared.take_health_rx().ok_or_else(|| {
            Status::failed_precondition("device list is already being watched")
        })?;
        let shared = self.shared.clone();
        let (tx, rx) =
            mpsc::channel::<std::result::Result<api::ListAndWatchResponse, Status>>(16);

        tokio::spawn(async move {
            let mut stopped = shared.subscribe_stop();
            let mut done = shared.subscribe_done();

            let initial = api::ListAndWatchResponse { devices: shared.clone_devices() };
            if tx.send(Ok(initial)).await.is_err() {
                return;
            }

            loop {
                tokio::select! {
                    update = health_rx.recv() => {
                        if update.is_none() {
                            break;
                        }
                        let response = api::ListAndWatchResponse { devices: shared.clone_devices() };
                        if tx.send(Ok(response)).await.is_err() {
                            return;
                        }
                    }
                    _ = async { let _ = stopped.wait_for(|s| *s).await; } => break,
                    _ = async { let _ = done.wait_for(|d| *d).await; } => break,
                }
            }

            // An empty list tells the node agent to drop every device of
            // this resource.
            let empty = api::ListAndWatchResponse { devices: vec![] };
            if tx.send(Ok(empty)).await.is_err() {
                warn!(resource = %shared.resource_name, "failed to send deregistration update");
            }
            shared.mark_deregistered();
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    #[instrument(skip_all, fields(resource = %self.shared.resource_name))]
    async fn allocate(
        &self,
        request: Request<api::AllocateRequest>,
    ) -> std::result::Result<Response<api::AllocateResponse>, Status> {
        info!("gRPC: Allocate");

        let request = request.into_inner();
        match (self.shared.ops.allocate)(&request) {
            Ok(response) => {
                obs::record_allocation(&self.shared.resource_name, true);
                Ok(Response::new(response))
            }
            Err(e) => {
                obs::record_allocation(&self.shared.resource_name, false);
                warn!(error = %e, "allocation failed");
                Err(Status::internal(e.to_string()))
            }
        }
    }

    async fn get_device_plugin_options(
        &self,
        _request: Request<api::Empty>,
    ) -> std::result::Result<Response<api::DevicePluginOptions>, Status> {
        Ok(Response::new(api::DevicePluginOptions { pre_start_required: false }))
    }

    async fn pre_start_container(
        &self,
        _request: Request<api::PreStartContainerRequest>,
    ) -> std::result::Result<Response<api::PreStartContainerResponse>, Status> {
        Ok(Response::new(api::PreStartContainerResponse {}))
    }
}
