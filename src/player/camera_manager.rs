//! Camera discovery
//!
//! The process-wide manager probes video4linux capture nodes once, on first
//! use. Embedders that discover devices some other way (or tests) build
//! their own manager with `with_devices` and feed hotplug events through
//! `add_device` / `remove_device`.

use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use parking_lot::Mutex;

use super::camera_device::CameraDevice;
use crate::signal::Signal;

const LOG_TARGET: &str = "immersive_media_bridge::camera";

/// Source element used for probed devices
const V4L2_FACTORY: &str = "v4l2src";
const SYSFS_VIDEO4LINUX: &str = "/sys/class/video4linux";

#[derive(Default)]
pub struct CameraManagerSignals {
    pub camera_added: Signal<CameraDevice>,
    pub camera_removed: Signal<CameraDevice>,
}

pub struct CameraManager {
    devices: Mutex<Vec<CameraDevice>>,
    signals: CameraManagerSignals,
}

impl CameraManager {
    /// Process-wide manager, probed on first call
    pub fn default() -> &'static CameraManager {
        static MANAGER: OnceLock<CameraManager> = OnceLock::new();
        MANAGER.get_or_init(|| {
            let devices = probe_video4linux(Path::new(SYSFS_VIDEO4LINUX));
            tracing::info!(target: LOG_TARGET, count = devices.len(), "probed camera devices");
            CameraManager::with_devices(devices)
        })
    }

    pub fn with_devices(devices: Vec<CameraDevice>) -> Self {
        Self {
            devices: Mutex::new(devices),
            signals: CameraManagerSignals::default(),
        }
    }

    pub fn camera_devices(&self) -> Vec<CameraDevice> {
        self.devices.lock().clone()
    }

    pub fn first_device(&self) -> Option<CameraDevice> {
        self.devices.lock().first().cloned()
    }

    pub fn find_by_node(&self, node: &str) -> Option<CameraDevice> {
        self.devices.lock().iter().find(|d| d.node() == node).cloned()
    }

    pub fn add_device(&self, device: CameraDevice) {
        tracing::info!(target: LOG_TARGET, node = device.node(), name = device.name(), "camera added");
        self.devices.lock().push(device.clone());
        self.signals.camera_added.emit(&device);
    }

    /// Remove the device matching `node` and `name`
    pub fn remove_device(&self, node: &str, name: &str) -> Option<CameraDevice> {
        let removed = {
            let mut devices = self.devices.lock();
            let index = devices.iter().position(|d| d.node() == node && d.name() == name)?;
            devices.remove(index)
        };
        tracing::info!(target: LOG_TARGET, node, name, "camera removed");
        self.signals.camera_removed.emit(&removed);
        Some(removed)
    }

    pub fn signals(&self) -> &CameraManagerSignals {
        &self.signals
    }
}

/// Capture nodes under a sysfs `video4linux` class directory.
///
/// Only primary interfaces (`index` 0) are kept, which skips the metadata
/// nodes UVC cameras expose next to their capture node.
fn probe_video4linux(class_dir: &Path) -> Vec<CameraDevice> {
    let entries = match fs::read_dir(class_dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!(target: LOG_TARGET, dir = %class_dir.display(), "no video4linux devices: {}", e);
            return Vec::new();
        }
    };

    let mut nodes: Vec<(String, String)> = entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let dir = entry.path();
            let node_name = entry.file_name().to_string_lossy().into_owned();
            if !node_name.starts_with("video") {
                return None;
            }
            let index = read_attribute(&dir, "index");
            if index.as_deref().is_some_and(|i| i != "0") {
                return None;
            }
            let name = read_attribute(&dir, "name").unwrap_or_else(|| node_name.clone());
            Some((format!("/dev/{}", node_name), name))
        })
        .collect();
    nodes.sort();

    nodes
        .into_iter()
        .map(|(node, name)| CameraDevice::new(V4L2_FACTORY, &node, &name, Vec::new()))
        .collect()
}

fn read_attribute(dir: &Path, attribute: &str) -> Option<String> {
    fs::read_to_string(dir.join(attribute))
        .ok()
        .map(|s| s.trim().to_string())
}
