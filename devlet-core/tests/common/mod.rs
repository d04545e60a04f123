//! Shared test harness: a fake node agent accepting plugin registrations
//! and a Unix-socket gRPC client for talking to plugins.

#![allow(dead_code)]

use devlet_api::deviceplugin::v1beta1 as api;
use devlet_api::deviceplugin::v1beta1::device_plugin_client::DevicePluginClient;
use devlet_api::deviceplugin::v1beta1::registration_server::{Registration, RegistrationServer};
use devlet_core::error::Result;
use devlet_core::host::DeviceHandler;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{UnixListener, UnixStream};
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::{Channel, Endpoint, Server, Uri};
use tonic::{Request, Response, Status};
use tower::service_fn;

/// Minimal node-agent stand-in: serves `Registration` on the well-known
/// socket inside the plugin directory and records every request.
pub struct FakeNodeAgent {
    pub registrations: Arc<Mutex<Vec<api::RegisterRequest>>>,
    shutdown: tokio::sync::watch::Sender<bool>,
}

struct RegistrationService {
    registrations: Arc<Mutex<Vec<api::RegisterRequest>>>,
}

#[tonic::async_trait]
impl Registration for RegistrationService {
    async fn register(
        &self,
        request: Request<api::RegisterRequest>,
    ) -> std::result::Result<Response<api::Empty>, Status> {
        self.registrations.lock().unwrap().push(request.into_inner());
        Ok(Response::new(api::Empty {}))
    }
}

impl FakeNodeAgent {
    pub async fn start(plugin_dir: &Path) -> Self {
        let socket = plugin_dir.join("kubelet.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let registrations = Arc::new(Mutex::new(Vec::new()));
        let service = RegistrationService { registrations: registrations.clone() };
        let (shutdown, mut shutdown_rx) = tokio::sync::watch::channel(false);

        tokio::spawn(async move {
            let _ = Server::builder()
                .add_service(RegistrationServer::new(service))
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                    let _ = shutdown_rx.wait_for(|s| *s).await;
                })
                .await;
        });

        Self { registrations, shutdown }
    }

    pub fn registered_resources(&self) -> Vec<String> {
        self.registrations.lock().unwrap().iter().map(|r| r.resource_name.clone()).collect()
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Connect a `DevicePlugin` client to a plugin's Unix socket.
pub async fn connect_plugin(socket: &Path) -> DevicePluginClient<Channel> {
    let path = socket.to_path_buf();
    let channel = Endpoint::try_from("http://[::]:50051")
        .unwrap()
        .connect_with_connector(service_fn(move |_: Uri| {
            let path = path.clone();
            async move { UnixStream::connect(path).await }
        }))
        .await
        .expect("failed to connect to the plugin socket");
    DevicePluginClient::new(channel)
}

/// Poll `condition` until it holds or the timeout elapses.
pub async fn wait_until(condition: impl Fn() -> bool, timeout: Duration, what: &str) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Read stream messages until one satisfies `predicate`, with a timeout.
pub async fn next_matching(
    stream: &mut tonic::Streaming<api::ListAndWatchResponse>,
    predicate: impl Fn(&api::ListAndWatchResponse) -> bool,
    what: &str,
) -> api::ListAndWatchResponse {
    let deadline = Duration::from_secs(10);
    let fut = async {
        loop {
            match stream.message().await {
                Ok(Some(response)) if predicate(&response) => return response,
                Ok(Some(_)) => continue,
                Ok(None) => panic!("stream closed while waiting for {}", what),
                Err(e) => panic!("stream error while waiting for {}: {}", what, e),
            }
        }
    };
    tokio::time::timeout(deadline, fut)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", what))
}

/// `DeviceHandler` that provisions mdevs into a fake sysfs tree and records
/// ownership changes, standing in for the privileged host helper.
pub struct FakeDeviceHandler {
    pub bus_root: PathBuf,
    pub devices_root: PathBuf,
    pub available_instances: u32,
    pub chowned: Mutex<Vec<PathBuf>>,
}

impl FakeDeviceHandler {
    pub fn new(bus_root: &Path, devices_root: &Path, available_instances: u32) -> Self {
        Self {
            bus_root: bus_root.to_path_buf(),
            devices_root: devices_root.to_path_buf(),
            available_instances,
            chowned: Mutex::new(Vec::new()),
        }
    }
}

impl DeviceHandler for FakeDeviceHandler {
    fn create_mdev(&self, type_id: &str, parent: &str, uuid: &uuid::Uuid) -> Result<()> {
        let uuid_dir = self.devices_root.join(uuid.to_string());
        std::fs::create_dir_all(&uuid_dir).unwrap();
        let type_dir = self.bus_root.join(parent).join("mdev_supported_types").join(type_id);
        std::os::unix::fs::symlink(type_dir, uuid_dir.join("mdev_type")).unwrap();
        Ok(())
    }

    fn remove_mdev(&self, uuid: &str) -> Result<()> {
        std::fs::remove_dir_all(self.devices_root.join(uuid)).unwrap();
        Ok(())
    }

    fn read_mdev_available_instances(&self, _type_id: &str, _parent: &str) -> Result<u32> {
        Ok(self.available_instances)
    }

    fn chown_unprivileged(&self, path: &Path) -> Result<()> {
        self.chowned.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }

    fn relabel(&self, _label: &str, _path: &Path) -> Result<()> {
        Ok(())
    }
}
