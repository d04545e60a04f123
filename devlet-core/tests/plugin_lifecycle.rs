//! End-to-end plugin runtime tests against a fake node agent: registration,
//! health transitions observed over ListAndWatch, allocation, and
//! deregistration on stop.

mod common;

use common::{connect_plugin, next_matching, wait_until, FakeNodeAgent};
use devlet_api::deviceplugin::v1beta1 as api;
use devlet_api::{HEALTHY, UNHEALTHY};
use devlet_core::discovery::generic::new_generic_device_plugin;
use devlet_core::plugin::PluginPaths;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;

struct PluginFixture {
    root: TempDir,
    plugin_dir: std::path::PathBuf,
}

impl PluginFixture {
    fn new() -> Self {
        let root = TempDir::new().unwrap();
        let plugin_dir = root.path().join("plugins");
        std::fs::create_dir_all(&plugin_dir).unwrap();
        std::fs::create_dir_all(root.path().join("dev")).unwrap();
        Self { root, plugin_dir }
    }

    fn paths(&self) -> PluginPaths {
        PluginPaths {
            plugin_dir: self.plugin_dir.clone(),
            device_root: self.root.path().to_path_buf(),
        }
    }

    fn device_node(&self) -> std::path::PathBuf {
        self.root.path().join("dev/fake0")
    }
}

fn all_health_is(response: &api::ListAndWatchResponse, health: &str) -> bool {
    !response.devices.is_empty() && response.devices.iter().all(|d| d.health == health)
}

#[tokio::test]
async fn test_health_sequence_over_list_and_watch() {
    let fixture = PluginFixture::new();
    std::fs::write(fixture.device_node(), "").unwrap();

    let agent = FakeNodeAgent::start(&fixture.plugin_dir).await;
    let plugin = Arc::new(new_generic_device_plugin(
        "devices.devlet.io/fake",
        Path::new("/dev/fake0"),
        2,
        "rw",
        false,
        &fixture.paths(),
    ));

    let (stop_tx, stop_rx) = watch::channel(false);
    let run_plugin = plugin.clone();
    let run = tokio::spawn(async move { run_plugin.run(stop_rx).await });

    wait_until(|| plugin.initialized(), Duration::from_secs(5), "plugin initialization").await;

    // Registration carried the resource name and the socket basename.
    let registrations = agent.registrations.lock().unwrap().clone();
    assert_eq!(registrations.len(), 1);
    assert_eq!(registrations[0].resource_name, "devices.devlet.io/fake");
    assert_eq!(registrations[0].endpoint, "devlet-fake.sock");

    let mut client = connect_plugin(plugin.socket_path()).await;
    let mut stream =
        client.list_and_watch(api::Empty {}).await.unwrap().into_inner();

    // Initial list: both synthetic devices, healthy (the node exists).
    let initial = next_matching(&mut stream, |r| r.devices.len() == 2, "initial device list").await;
    assert!(all_health_is(&initial, HEALTHY));

    // Delete the node: Healthy → Unhealthy.
    std::fs::remove_file(fixture.device_node()).unwrap();
    next_matching(&mut stream, |r| all_health_is(r, UNHEALTHY), "unhealthy transition").await;

    // Recreate it: Unhealthy → Healthy, in that order.
    std::fs::write(fixture.device_node(), "").unwrap();
    next_matching(&mut stream, |r| all_health_is(r, HEALTHY), "healthy transition").await;

    // Stop: one final empty list signals deregistration.
    stop_tx.send(true).unwrap();
    next_matching(&mut stream, |r| r.devices.is_empty(), "deregistration update").await;

    let result = tokio::time::timeout(Duration::from_secs(5), run).await.unwrap().unwrap();
    assert!(result.is_ok());
    // The socket is cleaned up on the way out.
    assert!(!plugin.socket_path().exists());
    agent.stop();
}

#[tokio::test]
async fn test_allocate_returns_device_specs() {
    let fixture = PluginFixture::new();
    std::fs::write(fixture.device_node(), "").unwrap();

    let agent = FakeNodeAgent::start(&fixture.plugin_dir).await;
    let plugin = Arc::new(new_generic_device_plugin(
        "devices.devlet.io/fake",
        Path::new("/dev/fake0"),
        2,
        "rw",
        false,
        &fixture.paths(),
    ));

    let (stop_tx, stop_rx) = watch::channel(false);
    let run_plugin = plugin.clone();
    let run = tokio::spawn(async move { run_plugin.run(stop_rx).await });
    wait_until(|| plugin.initialized(), Duration::from_secs(5), "plugin initialization").await;

    let mut client = connect_plugin(plugin.socket_path()).await;
    let response = client
        .allocate(api::AllocateRequest {
            container_requests: vec![api::ContainerAllocateRequest {
                devices_ids: vec!["fake01".to_string(), "not-a-device".to_string()],
            }],
        })
        .await
        .unwrap()
        .into_inner();

    assert_eq!(response.container_responses.len(), 1);
    let container = &response.container_responses[0];
    // The unknown id was skipped, the known one resolved to the node.
    assert_eq!(container.devices.len(), 1);
    assert_eq!(container.devices[0].host_path, "/dev/fake0");
    assert_eq!(container.devices[0].container_path, "/dev/fake0");
    assert_eq!(container.devices[0].permissions, "rw");

    stop_tx.send(true).unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(5), run).await;
    agent.stop();
}

#[tokio::test]
async fn test_start_fails_without_node_agent() {
    let fixture = PluginFixture::new();
    std::fs::write(fixture.device_node(), "").unwrap();

    // No FakeNodeAgent: registration must fail and the plugin never
    // becomes initialized.
    let plugin = Arc::new(new_generic_device_plugin(
        "devices.devlet.io/fake",
        Path::new("/dev/fake0"),
        1,
        "rw",
        false,
        &fixture.paths(),
    ));

    let (_stop_tx, stop_rx) = watch::channel(false);
    let result = plugin.run(stop_rx).await;
    assert!(result.is_err());
    assert!(!plugin.initialized());
    // The failed start leaves no stale socket behind.
    assert!(!plugin.socket_path().exists());
}

#[tokio::test]
async fn test_node_agent_restart_ends_the_run() {
    let fixture = PluginFixture::new();
    std::fs::write(fixture.device_node(), "").unwrap();

    let agent = FakeNodeAgent::start(&fixture.plugin_dir).await;
    let plugin = Arc::new(new_generic_device_plugin(
        "devices.devlet.io/fake",
        Path::new("/dev/fake0"),
        1,
        "rw",
        false,
        &fixture.paths(),
    ));

    let (_stop_tx, stop_rx) = watch::channel(false);
    let run_plugin = plugin.clone();
    let run = tokio::spawn(async move { run_plugin.run(stop_rx).await });
    wait_until(|| plugin.initialized(), Duration::from_secs(5), "plugin initialization").await;

    // A node agent restart wipes the plugin directory; removing the
    // plugin's socket must end the run cleanly so the supervisor
    // re-registers.
    std::fs::remove_file(plugin.socket_path()).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("run did not end after the socket was removed")
        .unwrap();
    assert!(result.is_ok());
    assert!(!plugin.initialized());
    agent.stop();
}
