//! Pipeline descriptor builder.
//!
//! Turns a [`CameraConfig`] into the ordered list of device-open descriptors a session tries:
//! the type-specific primary descriptor first, then a generic fallback that addresses the same
//! device through the platform's default backend. Everything here is pure; configurations
//! that can't work are rejected before any device I/O.

use std::fmt;
use std::path::PathBuf;

use crate::config::{CameraConfig, CameraId, CameraType};
use crate::{OurError, OurResult};

/// Name of the appsink every launch line ends in
pub const APPSINK: &str = "sink";

/// Capability tag: which kind of descriptor a backend knows how to open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    Usb,
    Csi,
    Ip,
    Generic,
}

impl fmt::Display for DescriptorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DescriptorKind::Usb => "usb",
            DescriptorKind::Csi => "csi",
            DescriptorKind::Ip => "ip",
            DescriptorKind::Generic => "generic",
        };
        f.write_str(name)
    }
}

/// Backend-specific parameters for opening one device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceDescriptor {
    /// V4L2 device node, raw YUY2 frames
    Usb {
        index: u32,
        device: PathBuf,
        width: u32,
        height: u32,
        fps: u32,
    },
    /// Ribbon-cable sensor behind the Argus ISP, NV12 frames
    Csi {
        sensor_id: u32,
        width: u32,
        height: u32,
        fps: u32,
    },
    /// RTSP/H.264 network stream, rescaled to the requested size
    Ip {
        location: String,
        width: u32,
        height: u32,
    },
    /// Whatever the platform default backend makes of this target
    Generic { target: CameraId },
}

impl DeviceDescriptor {
    pub fn kind(&self) -> DescriptorKind {
        match self {
            DeviceDescriptor::Usb { .. } => DescriptorKind::Usb,
            DeviceDescriptor::Csi { .. } => DescriptorKind::Csi,
            DeviceDescriptor::Ip { .. } => DescriptorKind::Ip,
            DeviceDescriptor::Generic { .. } => DescriptorKind::Generic,
        }
    }

    /// GStreamer launch line for this device, ending in an appsink named [`APPSINK`] that
    /// yields packed RGB frames
    pub fn pipeline(&self) -> String {
        match self {
            DeviceDescriptor::Usb {
                device,
                width,
                height,
                fps,
                ..
            } => format!(
                "v4l2src device={} ! video/x-raw, width={width}, height={height}, \
                 framerate={fps}/1, format=YUY2 ! videoconvert ! video/x-raw, format=RGB ! appsink name=sink",
                device.display()
            ),
            DeviceDescriptor::Csi {
                sensor_id,
                width,
                height,
                fps,
            } => format!(
                "nvarguscamerasrc sensor-id={sensor_id} ! video/x-raw(memory:NVMM), \
                 width={width}, height={height}, format=NV12, framerate={fps}/1 ! \
                 nvvidconv flip-method=0 ! video/x-raw, width={width}, height={height}, \
                 format=BGRx ! videoconvert ! video/x-raw, format=RGB ! appsink name=sink"
            ),
            DeviceDescriptor::Ip {
                location,
                width,
                height,
            } => format!(
                "rtspsrc location={location} ! rtph264depay ! h264parse ! avdec_h264 ! \
                 videoconvert ! video/x-raw, format=RGB ! videoscale ! \
                 video/x-raw, width={width}, height={height} ! appsink name=sink"
            ),
            DeviceDescriptor::Generic {
                target: CameraId::Index(_),
            } => "autovideosrc ! videoconvert ! video/x-raw, format=RGB ! appsink name=sink".to_string(),
            DeviceDescriptor::Generic {
                target: CameraId::Address(address),
            } => format!(
                "uridecodebin uri={address} ! videoconvert ! video/x-raw, format=RGB ! appsink name=sink"
            ),
        }
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceDescriptor::Usb { device, .. } => write!(f, "usb {}", device.display()),
            DeviceDescriptor::Csi { sensor_id, .. } => write!(f, "csi sensor {sensor_id}"),
            DeviceDescriptor::Ip { location, .. } => write!(f, "ip {location}"),
            DeviceDescriptor::Generic { target } => write!(f, "generic {target}"),
        }
    }
}

type DescriptorFactory = fn(&CameraConfig) -> OurResult<DeviceDescriptor>;

/// Tried in order when a session opens its device
const FACTORIES: [DescriptorFactory; 2] = [primary, fallback];

/// Ordered descriptors for `config`: primary, then generic fallback
pub fn descriptors(config: &CameraConfig) -> OurResult<Vec<DeviceDescriptor>> {
    validate(config)?;
    FACTORIES.iter().map(|factory| factory(config)).collect()
}

fn validate(config: &CameraConfig) -> OurResult<()> {
    if config.width == 0 || config.height == 0 {
        return Err(OurError::Configuration(format!(
            "camera {} has an empty resolution {}",
            config.id,
            config.resolution()
        )));
    }
    if config.fps == 0 {
        return Err(OurError::Configuration(format!(
            "camera {} requests 0 fps",
            config.id
        )));
    }
    Ok(())
}

fn require_index(config: &CameraConfig) -> OurResult<u32> {
    config.id.as_index().ok_or_else(|| {
        OurError::Configuration(format!(
            "{} camera needs a device index, got '{}'",
            config.camera_type, config.id
        ))
    })
}

fn primary(config: &CameraConfig) -> OurResult<DeviceDescriptor> {
    let CameraConfig {
        width, height, fps, ..
    } = *config;
    match &config.camera_type {
        CameraType::Usb => {
            let index = require_index(config)?;
            Ok(DeviceDescriptor::Usb {
                index,
                device: PathBuf::from(format!("/dev/video{index}")),
                width,
                height,
                fps,
            })
        }
        CameraType::Csi => Ok(DeviceDescriptor::Csi {
            sensor_id: require_index(config)?,
            width,
            height,
            fps,
        }),
        CameraType::Ip => match &config.id {
            CameraId::Address(location) if !location.is_empty() => Ok(DeviceDescriptor::Ip {
                location: location.clone(),
                width,
                height,
            }),
            other => Err(OurError::Configuration(format!(
                "ip camera needs a stream address, got '{other}'"
            ))),
        },
        CameraType::Unsupported(name) => Err(OurError::Configuration(format!(
            "unsupported camera type '{name}' for camera {}",
            config.id
        ))),
    }
}

fn fallback(config: &CameraConfig) -> OurResult<DeviceDescriptor> {
    Ok(DeviceDescriptor::Generic {
        target: config.id.clone(),
    })
}
