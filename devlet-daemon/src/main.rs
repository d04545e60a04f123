use devlet_core::discovery::generic::new_generic_device_plugin;
use devlet_core::discovery::DiscoveryPaths;
use devlet_core::{
    paths, watch_config, DeviceController, DevletConfig, LocalDeviceHandler, PluginPaths,
    PluginRuntime, DEVICE_NAMESPACE,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

mod shutdown;

/// How many containers may share each of the permanent device nodes.
const MAX_SHARED_DEVICES: usize = 110;

/// The plugins devlet always runs: the virtualization device nodes every
/// workload needs, independent of the permitted-devices configuration.
fn permanent_plugins(plugin_paths: &PluginPaths) -> Vec<PluginRuntime> {
    [
        ("kvm", "/dev/kvm", false),
        // Opening tun and vhost-net once autoloads their kernel modules.
        ("tun", "/dev/net/tun", true),
        ("vhost-net", "/dev/vhost-net", true),
    ]
    .into_iter()
    .map(|(name, device_path, preopen)| {
        new_generic_device_plugin(
            &format!("{}/{}", DEVICE_NAMESPACE, name),
            Path::new(device_path),
            MAX_SHARED_DEVICES,
            "rw",
            preopen,
            plugin_paths,
        )
    })
    .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    devlet_core::init_observability()?;

    info!("devletd starting");

    let metrics_port: u16 = std::env::var("DEVLET_METRICS_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(9419);
    if let Err(e) = PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], metrics_port))
        .install()
    {
        warn!(error = %e, "failed to install the metrics exporter");
    }

    let config_path = paths::config_path();
    let mut _static_config_tx = None;
    let (config_rx, _config_watcher) = match watch_config(config_path.clone()) {
        Ok((rx, watcher)) => (rx, Some(watcher)),
        Err(e) => {
            warn!(
                error = %e,
                path = ?config_path,
                "config hot reload unavailable, using a static configuration"
            );
            let config = DevletConfig::load(&config_path)?;
            let (tx, rx) = tokio::sync::watch::channel(config);
            _static_config_tx = Some(tx);
            (rx, None)
        }
    };

    let handler = Arc::new(LocalDeviceHandler::default());
    let discovery_paths = DiscoveryPaths::default();
    let permanent = permanent_plugins(&discovery_paths.plugin);
    let controller =
        Arc::new(DeviceController::new(permanent, config_rx, handler, discovery_paths));

    let stop_rx = shutdown::shutdown_signal();
    let controller_handle = tokio::spawn(controller.clone().run(stop_rx.clone()));

    // Readiness for the heartbeat collaborator: all desired plugins
    // initialized, polled on an interval and exported as a gauge.
    {
        let controller = controller.clone();
        let mut stop_rx = stop_rx.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(10));
            loop {
                tokio::select! {
                    _ = stop_rx.wait_for(|s| *s) => return,
                    _ = tick.tick() => {
                        devlet_core::observability::metrics::set_ready(controller.initialized());
                    }
                }
            }
        });
    }

    info!("devletd ready");

    // Wait for shutdown signal
    let mut stop_wait = stop_rx.clone();
    let _ = stop_wait.wait_for(|s| *s).await;

    info!("devletd shutting down");
    match tokio::time::timeout(Duration::from_secs(10), controller_handle).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => error!(error = %e, "device controller exited with error"),
        Ok(Err(e)) => error!(error = %e, "device controller task failed"),
        Err(_) => warn!("device controller did not stop in time"),
    }

    info!("devletd stopped");
    Ok(())
}
