//! The device controller.
//!
//! Reconciles the permitted-device configuration against the set of running
//! device plugins: newly desired resources are discovered and started, no
//! longer desired ones are stopped, and a failing plugin start is retried
//! with bounded exponential backoff. Each resource's lifecycle is fully
//! independent; one plugin's slow registration never blocks another's
//! startup.

use crate::config::{DevletConfig, PermittedDevices};
use crate::discovery::{mediated, pci, usb, DiscoveryPaths};
use crate::error::Result;
use crate::host::DeviceHandler;
use crate::mdev::MdevTypesManager;
use crate::observability::metrics as obs;
use crate::plugin::PluginRuntime;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Delays between successive start attempts of one plugin, capped at the
/// last entry.
const START_BACKOFF: [Duration; 4] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(5),
    Duration::from_secs(10),
];

/// How often the controller re-reconciles even without a config change, to
/// pick up hardware that appeared or vanished.
const RESYNC_PERIOD: Duration = Duration::from_secs(60);

struct ControlledPlugin {
    runtime: Arc<PluginRuntime>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
    device_count: usize,
}

pub struct DeviceController {
    config_rx: watch::Receiver<DevletConfig>,
    handler: Arc<dyn DeviceHandler>,
    paths: DiscoveryPaths,
    permanent: Vec<Arc<PluginRuntime>>,
    started: Mutex<HashMap<String, ControlledPlugin>>,
    mdev_manager: MdevTypesManager,
}

impl DeviceController {
    pub fn new(
        permanent_plugins: Vec<PluginRuntime>,
        config_rx: watch::Receiver<DevletConfig>,
        handler: Arc<dyn DeviceHandler>,
        paths: DiscoveryPaths,
    ) -> Self {
        let mdev_manager = MdevTypesManager::new(
            handler.clone(),
            paths.mdev_bus_root.clone(),
            paths.mdev_devices_root.clone(),
        );
        Self {
            config_rx,
            handler,
            paths,
            permanent: permanent_plugins.into_iter().map(Arc::new).collect(),
            started: Mutex::new(HashMap::new()),
            mdev_manager,
        }
    }

    /// True only once every currently tracked plugin reports initialized.
    /// Gates node-schedulability reporting in the heartbeat collaborator.
    pub fn initialized(&self) -> bool {
        self.started.lock().unwrap().values().all(|plugin| plugin.runtime.initialized())
    }

    /// Run until `stop` flips to true: start the permanent plugins, then
    /// reconcile on every configuration change and on a periodic resync.
    pub async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) -> Result<()> {
        info!("device controller starting");

        {
            let mut started = self.started.lock().unwrap();
            for runtime in &self.permanent {
                info!(resource = %runtime.resource_name(), "starting permanent device plugin");
                started.insert(runtime.resource_name().to_string(), self.spawn_plugin(runtime.clone()));
            }
            obs::set_plugins_running(started.len());
        }

        let mut config_rx = self.config_rx.clone();
        let initial = config_rx.borrow().clone();
        self.reconcile(&initial).await;

        let mut resync = tokio::time::interval(RESYNC_PERIOD);
        resync.set_missed_tick_behavior(MissedTickBehavior::Skip);
        resync.tick().await; // the first tick fires immediately

        loop {
            tokio::select! {
                _ = async { let _ = stop.wait_for(|s| *s).await; } => break,
                changed = config_rx.changed() => {
                    if changed.is_err() {
                        // Config source is gone; keep the current state.
                        break;
                    }
                    let config = config_rx.borrow_and_update().clone();
                    info!("device configuration changed, reconciling");
                    self.reconcile(&config).await;
                }
                _ = resync.tick() => {
                    let config = config_rx.borrow().clone();
                    debug!("periodic device resync");
                    self.reconcile(&config).await;
                }
            }
        }

        info!("device controller stopping");
        self.stop_all().await;
        Ok(())
    }

    async fn reconcile(&self, config: &DevletConfig) {
        self.refresh_permitted_devices(config);
        self.refresh_mediated_device_types(config).await;
    }

    /// Diff desired resources against running plugins. Running plugins keep
    /// running untouched unless their discovered device set changed size, in
    /// which case they are restarted with the fresh device list.
    fn refresh_permitted_devices(&self, config: &DevletConfig) {
        let desired = self.build_desired_plugins(&config.permitted_devices);
        let permanent: HashSet<&str> =
            self.permanent.iter().map(|p| p.resource_name()).collect();

        let mut started = self.started.lock().unwrap();

        let obsolete: Vec<String> = started
            .iter()
            .filter(|(name, controlled)| {
                if permanent.contains(name.as_str()) {
                    return false;
                }
                match desired.get(*name) {
                    Some(runtime) => runtime.device_count() != controlled.device_count,
                    None => true,
                }
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in obsolete {
            if let Some(controlled) = started.remove(&name) {
                info!(resource = %name, "stopping device plugin");
                controlled.stop.send_replace(true);
            }
        }

        for (name, runtime) in desired {
            if !started.contains_key(&name) {
                info!(resource = %name, devices = runtime.device_count(), "starting device plugin");
                started.insert(name, self.spawn_plugin(runtime));
            }
        }
        obs::set_plugins_running(started.len());
    }

    /// Run discovery for every configured resource and construct the plugin
    /// for each one that has devices. Resources served by an external
    /// provider are skipped.
    fn build_desired_plugins(
        &self,
        permitted: &PermittedDevices,
    ) -> HashMap<String, Arc<PluginRuntime>> {
        let mut desired: HashMap<String, Arc<PluginRuntime>> = HashMap::new();
        let plugin_paths = &self.paths.plugin;

        let pci_by_selector = pci::discover_pci_devices(&self.paths.pci_root);
        for host_device in &permitted.pci_host_devices {
            if host_device.external_resource_provider {
                continue;
            }
            let selector = host_device.pci_vendor_selector.to_lowercase();
            if let Some(devices) = pci_by_selector.get(&selector) {
                desired.insert(
                    host_device.resource_name.clone(),
                    Arc::new(pci::new_pci_device_plugin(
                        &host_device.resource_name,
                        devices,
                        plugin_paths,
                    )),
                );
            }
        }

        let mdevs_by_type =
            mediated::discover_mdevs(&self.paths.mdev_devices_root, &self.paths.pci_root);
        for host_device in &permitted.mediated_devices {
            if host_device.external_resource_provider {
                continue;
            }
            let selector = mediated::normalize_selector(&host_device.mdev_name_selector);
            if let Some(devices) = mdevs_by_type.get(&selector) {
                desired.insert(
                    host_device.resource_name.clone(),
                    Arc::new(mediated::new_mdev_device_plugin(
                        &host_device.resource_name,
                        devices,
                        plugin_paths,
                    )),
                );
            }
        }

        for (resource_name, groups) in
            usb::discover_allowed_usb_devices(&permitted.usb_host_devices, &self.paths.usb_root)
        {
            desired.insert(
                resource_name.clone(),
                Arc::new(usb::new_usb_device_plugin(
                    &resource_name,
                    groups,
                    self.handler.clone(),
                    plugin_paths,
                )),
            );
        }

        desired
    }

    /// Launch one plugin's supervision task: run the plugin, restart it when
    /// it exits (immediately after a clean exit such as a node agent
    /// restart, with capped backoff after a failure), quit on stop.
    fn spawn_plugin(&self, runtime: Arc<PluginRuntime>) -> ControlledPlugin {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let device_count = runtime.device_count();
        let task_runtime = runtime.clone();

        let task = tokio::spawn(async move {
            let mut attempt = 0usize;
            loop {
                match task_runtime.run(stop_rx.clone()).await {
                    Ok(()) => {
                        attempt = 0;
                    }
                    Err(e) => {
                        obs::record_plugin_start_failure(task_runtime.resource_name());
                        let delay = START_BACKOFF[attempt.min(START_BACKOFF.len() - 1)];
                        attempt += 1;
                        warn!(
                            resource = %task_runtime.resource_name(),
                            error = %e,
                            retry_in = ?delay,
                            "device plugin failed"
                        );
                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {}
                            _ = stop_rx.wait_for(|s| *s) => return,
                        }
                    }
                }
                if *stop_rx.borrow() {
                    return;
                }
            }
        });

        ControlledPlugin { runtime, stop: stop_tx, task, device_count }
    }

    async fn refresh_mediated_device_types(&self, config: &DevletConfig) {
        let desired =
            config.mediated_devices_configuration.desired_types(&config.node_labels);
        let externally_handled = self.externally_handled_mdevs(&config.permitted_devices);
        match self
            .mdev_manager
            .update_mdev_types_configuration(&desired, &externally_handled)
            .await
        {
            Ok(configured) => {
                debug!(types = ?configured, "mediated device types reconciled");
            }
            Err(e) => warn!(error = %e, "failed to reconcile mediated device types"),
        }
    }

    /// UUIDs of mdevs whose type is served by an external device plugin;
    /// those must survive reconciliation untouched.
    fn externally_handled_mdevs(&self, permitted: &PermittedDevices) -> HashSet<String> {
        let external_selectors: HashSet<String> = permitted
            .mediated_devices
            .iter()
            .filter(|m| m.external_resource_provider)
            .map(|m| mediated::normalize_selector(&m.mdev_name_selector))
            .collect();
        if external_selectors.is_empty() {
            return HashSet::new();
        }
        mediated::discover_mdevs(&self.paths.mdev_devices_root, &self.paths.pci_root)
            .into_iter()
            .filter(|(type_name, _)| external_selectors.contains(type_name))
            .flat_map(|(_, devices)| devices.into_iter().map(|d| d.uuid))
            .collect()
    }

    async fn stop_all(&self) {
        let drained: Vec<(String, ControlledPlugin)> =
            self.started.lock().unwrap().drain().collect();
        for (name, controlled) in &drained {
            debug!(resource = %name, "signalling device plugin to stop");
            controlled.stop.send_replace(true);
        }
        for (name, controlled) in drained {
            if tokio::time::timeout(Duration::from_secs(5), controlled.task).await.is_err() {
                warn!(resource = %name, "device plugin did not stop in time");
            }
        }
        obs::set_plugins_running(0);
    }
}
