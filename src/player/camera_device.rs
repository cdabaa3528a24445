//! Camera device handle

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::signal::Signal;

struct DeviceInner {
    factory: String,
    node: String,
    name: String,
    /// Largest first
    supported_resolutions: Vec<(u32, u32)>,
    capture_resolution: Mutex<Option<(u32, u32)>>,
    capture_resolution_changed: Signal<(u32, u32)>,
}

/// A capture device. Cheap to clone; clones refer to the same device.
#[derive(Clone)]
pub struct CameraDevice {
    inner: Arc<DeviceInner>,
}

impl CameraDevice {
    /// `factory` names the source element (e.g. `v4l2src`), `node` the
    /// device path it opens. Resolutions are de-duplicated and ordered by
    /// area, largest first; the largest becomes the capture resolution.
    pub fn new(factory: &str, node: &str, name: &str, resolutions: Vec<(u32, u32)>) -> Self {
        let mut supported: Vec<(u32, u32)> = Vec::with_capacity(resolutions.len());
        for res in resolutions {
            if res.0 > 0 && res.1 > 0 && !supported.contains(&res) {
                supported.push(res);
            }
        }
        // Stable: equal areas keep discovery order
        supported.sort_by(|a, b| (b.0 as u64 * b.1 as u64).cmp(&(a.0 as u64 * a.1 as u64)));

        let capture = supported.first().copied();
        tracing::debug!(
            target: "immersive_media_bridge::camera",
            node,
            name,
            resolutions = supported.len(),
            "camera device"
        );
        Self {
            inner: Arc::new(DeviceInner {
                factory: factory.to_string(),
                node: node.to_string(),
                name: name.to_string(),
                supported_resolutions: supported,
                capture_resolution: Mutex::new(capture),
                capture_resolution_changed: Signal::new(),
            }),
        }
    }

    pub fn factory(&self) -> &str {
        &self.inner.factory
    }

    pub fn node(&self) -> &str {
        &self.inner.node
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn supported_resolutions(&self) -> &[(u32, u32)] {
        &self.inner.supported_resolutions
    }

    /// `None` until a resolution is known
    pub fn capture_resolution(&self) -> Option<(u32, u32)> {
        *self.inner.capture_resolution.lock()
    }

    /// Change the capture size; cameras bound to this device follow
    pub fn set_capture_resolution(&self, width: u32, height: u32) {
        *self.inner.capture_resolution.lock() = Some((width, height));
        self.inner.capture_resolution_changed.emit(&(width, height));
    }

    pub fn capture_resolution_changed(&self) -> &Signal<(u32, u32)> {
        &self.inner.capture_resolution_changed
    }

    pub fn ptr_eq(&self, other: &CameraDevice) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for CameraDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CameraDevice")
            .field("factory", &self.inner.factory)
            .field("node", &self.inner.node)
            .field("name", &self.inner.name)
            .field("capture_resolution", &self.capture_resolution())
            .finish()
    }
}
