//! Filesystem-event-driven device health monitoring.
//!
//! The monitor answers "is device X still present and usable?" without
//! polling: every device's backing path is resolved to a watch on its parent
//! directory (watching the file itself would lose the watch when the node is
//! replaced), create/remove events are mapped back to device identities
//! through the monitored-path map, and each transition is pushed to the
//! plugin's `ListAndWatch` stream.

use crate::error::{DevletError, Result};
use crate::plugin::PluginShared;
use devlet_api::{HEALTHY, UNHEALTHY};
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// The monitored-path map a device class builds at plugin start: which
/// filesystem paths stand for which device IDs, and which directories the
/// watcher must cover. Built once, never mutated afterwards.
#[derive(Default)]
pub struct MonitoredDevices {
    paths: HashMap<PathBuf, String>,
    dirs: BTreeSet<PathBuf>,
}

impl MonitoredDevices {
    /// Monitor `path` as the backing node of one device. The parent
    /// directory is registered for watching automatically.
    pub fn monitor(&mut self, path: impl Into<PathBuf>, device_id: impl Into<String>) {
        let path = path.into();
        if let Some(parent) = path.parent() {
            self.dirs.insert(parent.to_path_buf());
        }
        self.paths.insert(path, device_id.into());
    }

    /// Monitor `path` as the backing node of every device of the resource.
    pub fn monitor_all(&mut self, path: impl Into<PathBuf>) {
        self.monitor(path, "");
    }

    /// Watch an additional directory, e.g. the grandparent of a device node
    /// so whole device directories appearing or disappearing are observed.
    pub fn watch_dir(&mut self, dir: impl Into<PathBuf>) {
        self.dirs.insert(dir.into());
    }
}

enum FsOp {
    Created,
    Removed,
}

fn classify(kind: &EventKind) -> Option<FsOp> {
    match kind {
        EventKind::Create(_) => Some(FsOp::Created),
        EventKind::Remove(_) => Some(FsOp::Removed),
        // A rename away from a watched name is a removal, a rename onto it
        // is a creation.
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Some(FsOp::Removed),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some(FsOp::Created),
        _ => None,
    }
}

pub(crate) struct HealthMonitor {
    state: MonitorState,
    events: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
}

struct MonitorState {
    shared: Arc<PluginShared>,
    watcher: RecommendedWatcher,
    /// path → device id; an empty id stands for every device.
    monitored: HashMap<PathBuf, String>,
    /// Every ancestor directory of a monitored path, for O(1) "should this
    /// created directory be added to the watcher" checks.
    ancestor_dirs: HashSet<PathBuf>,
    /// device id → last published health, to suppress duplicate updates.
    last_known: HashMap<String, &'static str>,
}

impl HealthMonitor {
    /// Build the watch context: run the class's `setup_monitored_devices`,
    /// register all watches, and verify the plugin's own socket. Watches are
    /// registered before the initial stat pass so no event is lost in
    /// between.
    pub(crate) fn new(shared: Arc<PluginShared>) -> Result<Self> {
        let (tx, events) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })?;

        let mut monitored = MonitoredDevices::default();
        (shared.ops.setup_monitored_devices)(&mut monitored)?;

        // A missing directory here is a setup failure: the controller
        // retries the whole plugin start with backoff until it appears.
        for dir in &monitored.dirs {
            watcher.watch(dir, RecursiveMode::NonRecursive)?;
        }

        let mut ancestor_dirs = HashSet::new();
        for path in monitored.paths.keys() {
            let mut dir = path.parent();
            while let Some(d) = dir {
                if d.as_os_str().is_empty() || d == Path::new("/") {
                    break;
                }
                ancestor_dirs.insert(d.to_path_buf());
                dir = d.parent();
            }
        }

        // Watch the plugin's own socket so a node agent restart (which wipes
        // the device-plugin directory) is noticed.
        let socket_dir = shared.socket_path.parent().ok_or_else(|| {
            DevletError::HealthMonitorSetup {
                reason: format!("plugin socket {:?} has no parent directory", shared.socket_path),
            }
        })?;
        watcher.watch(socket_dir, RecursiveMode::NonRecursive)?;
        std::fs::metadata(&shared.socket_path).map_err(|e| DevletError::HealthMonitorSetup {
            reason: format!("failed to stat the plugin socket {:?}: {}", shared.socket_path, e),
        })?;

        Ok(Self {
            state: MonitorState {
                shared,
                watcher,
                monitored: monitored.paths,
                ancestor_dirs,
                last_known: HashMap::new(),
            },
            events,
        })
    }

    /// Watch until stop fires, the event source closes, or the plugin's own
    /// socket disappears. Transient errors never end the loop.
    pub(crate) async fn run(self) -> Result<()> {
        let HealthMonitor { mut state, mut events } = self;
        let mut stopped = state.shared.subscribe_stop();

        // Initial pass: publish the current state of every monitored path.
        state.static_health_check(None);

        loop {
            tokio::select! {
                _ = stopped.wait_for(|s| *s) => return Ok(()),
                event = events.recv() => {
                    let Some(event) = event else { return Ok(()) };
                    match event {
                        Err(e) => {
                            error!(error = %e, "error watching devices and plugin directory");
                        }
                        Ok(event) => {
                            if !state.handle_event(&event) {
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }
    }
}

impl MonitorState {
    /// Returns false when the plugin must stop (its own socket vanished).
    fn handle_event(&mut self, event: &notify::Event) -> bool {
        let Some(op) = classify(&event.kind) else { return true };
        for path in event.paths.clone() {
            if let Some(device_id) = self.monitored.get(&path).cloned() {
                let friendly = self.shared.friendly_name(&device_id);
                match op {
                    FsOp::Created => {
                        info!(
                            device = %friendly,
                            resource = %self.shared.resource_name,
                            "monitored device appeared"
                        );
                        let ok = self.configure_permissions(&path);
                        self.report(&device_id, &path, ok);
                    }
                    FsOp::Removed => {
                        info!(
                            device = %friendly,
                            resource = %self.shared.resource_name,
                            "monitored device disappeared"
                        );
                        self.report(&device_id, &path, false);
                    }
                }
            } else if matches!(op, FsOp::Created) && self.ancestor_dirs.contains(&path) {
                // A directory above a monitored device appeared; watch it and
                // re-stat the devices below it, since events may have fired
                // before the watch was in place.
                if let Err(e) = self.watcher.watch(&path, RecursiveMode::NonRecursive) {
                    warn!(path = ?path, error = %e, "failed to watch appeared directory");
                }
                self.static_health_check(Some(&path));
            } else if matches!(op, FsOp::Removed) && path == self.shared.socket_path {
                info!(
                    resource = %self.shared.resource_name,
                    "plugin socket was removed, node agent probably restarted"
                );
                return false;
            }
        }
        true
    }

    /// Stat monitored paths and publish their health. `scope` limits the
    /// pass to devices under one directory (used when a parent directory
    /// appears late); `None` checks everything.
    fn static_health_check(&mut self, scope: Option<&Path>) {
        let in_scope: Vec<(PathBuf, String)> = self
            .monitored
            .iter()
            .filter(|(path, _)| scope.map_or(true, |s| path.as_path() == s || path.starts_with(s)))
            .map(|(path, id)| (path.clone(), id.clone()))
            .collect();

        for (path, device_id) in in_scope {
            match std::fs::metadata(&path) {
                Ok(_) => {
                    let ok = self.configure_permissions(&path);
                    self.report(&device_id, &path, ok);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(
                        device = %self.shared.friendly_name(&device_id),
                        path = ?path,
                        "device not present, waiting for it to be created"
                    );
                    self.report(&device_id, &path, false);
                }
                Err(e) => {
                    // Transient read failure: degrade the device, keep watching.
                    warn!(path = ?path, error = %e, "could not stat monitored device");
                    self.report(&device_id, &path, false);
                }
            }
        }
    }

    fn configure_permissions(&self, path: &Path) -> bool {
        let Some(hook) = &self.shared.ops.configure_permissions else {
            return true;
        };
        match hook(path) {
            Ok(()) => true,
            Err(e) => {
                warn!(path = ?path, error = %e, "failed to configure permissions for monitored device");
                false
            }
        }
    }

    fn report(&mut self, device_id: &str, path: &Path, healthy: bool) {
        let mut healthy = healthy;
        if let Some(mutate) = &self.shared.ops.mutate_health {
            healthy = match mutate(device_id, path, healthy) {
                Ok(updated) => updated,
                Err(e) => {
                    warn!(
                        device = %self.shared.friendly_name(device_id),
                        error = %e,
                        "health mutation hook failed"
                    );
                    false
                }
            };
        }

        let status = if healthy { HEALTHY } else { UNHEALTHY };
        // Only actual transitions reach the node agent.
        if self.last_known.get(device_id) == Some(&status) {
            return;
        }
        self.last_known.insert(device_id.to_string(), status);

        let friendly = self.shared.friendly_name(device_id);
        if healthy {
            info!(device = %friendly, "device is now healthy");
        } else {
            warn!(device = %friendly, "device is now unhealthy");
        }
        self.shared.update_device_health(device_id, healthy);
    }
}
