//! Device backends.
//!
//! A backend turns a [`DeviceDescriptor`] into an open [`CaptureDevice`]. Each backend
//! declares which descriptor kinds it can handle; [`Backends::open`] walks a camera's
//! descriptors in order and hands each one to every backend that claims it, so adding a
//! backend never means touching the session code.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::CameraId;
use crate::frame::Frame;
use crate::pipeline::{DescriptorKind, DeviceDescriptor};
use crate::{OurError, OurResult};

#[cfg(feature = "gstreamer-pipeline")]
pub mod gst;
pub mod native;
pub mod synthetic;

#[cfg(feature = "gstreamer-pipeline")]
pub use gst::GstBackend;
pub use native::NativeBackend;
pub use synthetic::{BlockMode, SyntheticBackend, SyntheticOptions};

/// Closes a device from outside its acquisition thread, unblocking a pending read
pub type ReleaseHandle = Arc<dyn Fn() + Send + Sync>;

/// What the device says it is actually doing, as far as it will tell
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceReport {
    pub fps: Option<f64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// An open device. Lives on its session's acquisition thread for its whole life.
pub trait CaptureDevice {
    /// Block until the next frame is available
    fn read_frame(&mut self) -> OurResult<Frame>;

    /// Request a capture size and rate. Devices may settle on the closest they support.
    fn apply_format(&mut self, width: u32, height: u32, fps: u32) -> OurResult<()>;

    /// Keep as few frames queued inside the device as it allows
    fn minimize_buffering(&mut self) -> OurResult<()> {
        Ok(())
    }

    fn report(&self) -> DeviceReport {
        DeviceReport::default()
    }

    /// Out-of-band release, for backends that can interrupt a blocked read
    fn release_handle(&self) -> Option<ReleaseHandle> {
        None
    }
}

pub trait DeviceBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Descriptor kinds this backend can open
    fn capabilities(&self) -> &[DescriptorKind];

    fn open(&self, descriptor: &DeviceDescriptor) -> OurResult<Box<dyn CaptureDevice>>;

    fn supports(&self, kind: DescriptorKind) -> bool {
        self.capabilities().contains(&kind)
    }
}

/// A device that opened, and what opened it
pub struct OpenedDevice {
    pub device: Box<dyn CaptureDevice>,
    pub backend: &'static str,
    pub descriptor: DeviceDescriptor,
}

/// Ordered set of backends shared by every session of a registry
#[derive(Clone, Default)]
pub struct Backends {
    backends: Vec<Arc<dyn DeviceBackend>>,
}

impl fmt::Debug for Backends {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.backends.iter().map(|backend| backend.name()))
            .finish()
    }
}

impl Backends {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, backend: impl DeviceBackend + 'static) -> Self {
        self.backends.push(Arc::new(backend));
        self
    }

    /// The platform camera stack, then GStreamer when built with `gstreamer-pipeline`
    pub fn native() -> Self {
        let backends = Self::new().with(NativeBackend::new());

        #[cfg(feature = "gstreamer-pipeline")]
        let backends = match GstBackend::new() {
            Ok(gst) => backends.with(gst),
            Err(e) => {
                warn!("{e}; CSI and IP cameras can't be opened");
                backends
            }
        };
        #[cfg(not(feature = "gstreamer-pipeline"))]
        debug!("Built without GStreamer; CSI and IP cameras can't be opened");

        backends
    }

    pub fn synthetic(backend: SyntheticBackend) -> Self {
        Self::new().with(backend)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.backends.iter().map(|backend| backend.name()).collect()
    }

    /// Try each descriptor in order; the first device that opens wins
    pub fn open(
        &self,
        camera: &CameraId,
        descriptors: &[DeviceDescriptor],
    ) -> OurResult<OpenedDevice> {
        let mut failures = Vec::new();

        for descriptor in descriptors {
            let mut candidates = self
                .backends
                .iter()
                .filter(|backend| backend.supports(descriptor.kind()))
                .peekable();

            if candidates.peek().is_none() {
                debug!("Camera {camera}: no backend can open {descriptor}");
                failures.push(format!("{descriptor}: no backend"));
                continue;
            }

            for backend in candidates {
                debug!(
                    "Camera {camera}: opening {descriptor} with {} ({})",
                    backend.name(),
                    descriptor.pipeline()
                );
                match backend.open(descriptor) {
                    Ok(device) => {
                        return Ok(OpenedDevice {
                            device,
                            backend: backend.name(),
                            descriptor: descriptor.clone(),
                        });
                    }
                    Err(e) => {
                        warn!(
                            "Camera {camera}: {} failed to open {descriptor}: {e}",
                            backend.name()
                        );
                        failures.push(format!("{descriptor} via {}: {e}", backend.name()));
                    }
                }
            }
        }

        Err(OurError::DeviceOpen {
            camera: camera.clone(),
            reason: if failures.is_empty() {
                "no descriptors to try".to_string()
            } else {
                failures.join("; ")
            },
        })
    }
}
