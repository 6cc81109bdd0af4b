//! GStreamer backend: launches a descriptor's pipeline and pulls RGB frames from its appsink.
//!
//! Covers what the platform camera stack can't reach: CSI sensors behind `nvarguscamerasrc`,
//! RTSP streams, and stream URIs handed to the generic fallback. USB devices are claimed too,
//! as a second chance after the native backend. Built with the `gstreamer-pipeline` feature.

use std::sync::Arc;

use gstreamer::prelude::*;
use gstreamer::{ClockTime, Pipeline, State};
use gstreamer_app::AppSink;
use gstreamer_video::{VideoFormat, VideoInfo};
use tracing::{debug, info, warn};

use super::{CaptureDevice, DeviceBackend, DeviceReport, ReleaseHandle};
use crate::frame::Frame;
use crate::pipeline::{APPSINK, DescriptorKind, DeviceDescriptor};
use crate::{OurError, OurResult};

const CAPABILITIES: [DescriptorKind; 4] = [
    DescriptorKind::Usb,
    DescriptorKind::Csi,
    DescriptorKind::Ip,
    DescriptorKind::Generic,
];

/// A read that sees no sample for this long counts as a failed read
const PULL_TIMEOUT_SECS: u64 = 1;
const PLAYING_TIMEOUT_SECS: u64 = 5;

#[derive(Debug)]
pub struct GstBackend;

impl GstBackend {
    /// Initialise GStreamer; fails when its runtime isn't usable on this machine
    pub fn new() -> OurResult<Self> {
        gstreamer::init()
            .map_err(|e| OurError::App(format!("Failed to initialize GStreamer: {e}")))?;
        Ok(Self)
    }
}

impl DeviceBackend for GstBackend {
    fn name(&self) -> &'static str {
        "gstreamer"
    }

    fn capabilities(&self) -> &[DescriptorKind] {
        &CAPABILITIES
    }

    fn open(&self, descriptor: &DeviceDescriptor) -> OurResult<Box<dyn CaptureDevice>> {
        let device = launch(&descriptor.pipeline(), expected_report(descriptor))?;
        info!("Opened {descriptor} through GStreamer");
        Ok(Box::new(device))
    }
}

/// Parse and start `line`, which must end in the appsink named [`APPSINK`]
fn launch(line: &str, report: DeviceReport) -> OurResult<GstDevice> {
    debug!("Launching pipeline: {line}");
    let pipeline = gstreamer::parse::launch(line)
        .map_err(|e| OurError::App(format!("Failed to parse pipeline: {e}")))?
        .downcast::<Pipeline>()
        .map_err(|_| OurError::App("Launch line did not produce a pipeline".to_string()))?;

    let sink = pipeline
        .by_name(APPSINK)
        .ok_or_else(|| OurError::App(format!("Pipeline has no element named {APPSINK}")))?
        .downcast::<AppSink>()
        .map_err(|_| OurError::App(format!("Element {APPSINK} is not an appsink")))?;
    sink.set_property("emit-signals", false);
    sink.set_property("sync", false);

    // from here on Drop tears the pipeline down
    let device = GstDevice {
        pipeline,
        sink,
        report,
    };
    device
        .pipeline
        .set_state(State::Playing)
        .map_err(|e| OurError::App(format!("Failed to start pipeline: {e:?}")))?;
    let (result, _, _) = device
        .pipeline
        .state(Some(ClockTime::from_seconds(PLAYING_TIMEOUT_SECS)));
    result.map_err(|e| OurError::App(format!("Pipeline never reached playing: {e:?}")))?;
    Ok(device)
}

/// What the launch line's caps ask for, until the first sample says otherwise
fn expected_report(descriptor: &DeviceDescriptor) -> DeviceReport {
    match descriptor {
        DeviceDescriptor::Usb {
            width, height, fps, ..
        }
        | DeviceDescriptor::Csi {
            width, height, fps, ..
        } => DeviceReport {
            fps: Some(f64::from(*fps)),
            width: Some(*width),
            height: Some(*height),
        },
        DeviceDescriptor::Ip { width, height, .. } => DeviceReport {
            fps: None,
            width: Some(*width),
            height: Some(*height),
        },
        DeviceDescriptor::Generic { .. } => DeviceReport::default(),
    }
}

struct GstDevice {
    pipeline: Pipeline,
    sink: AppSink,
    report: DeviceReport,
}

impl CaptureDevice for GstDevice {
    fn read_frame(&mut self) -> OurResult<Frame> {
        let sample = self
            .sink
            .try_pull_sample(Some(ClockTime::from_seconds(PULL_TIMEOUT_SECS)))
            .ok_or_else(|| {
                OurError::TransientRead(if self.sink.is_eos() {
                    "pipeline reached end of stream".to_string()
                } else {
                    format!("no sample within {PULL_TIMEOUT_SECS}s")
                })
            })?;

        let caps = sample
            .caps()
            .ok_or_else(|| OurError::TransientRead("sample has no caps".to_string()))?;
        let info = VideoInfo::from_caps(caps)
            .map_err(|e| OurError::TransientRead(format!("unreadable sample caps: {e}")))?;
        if info.format() != VideoFormat::Rgb {
            return Err(OurError::TransientRead(format!(
                "expected RGB samples, got {:?}",
                info.format()
            )));
        }

        let buffer = sample
            .buffer()
            .ok_or_else(|| OurError::TransientRead("sample has no buffer".to_string()))?;
        let map = buffer
            .map_readable()
            .map_err(|e| OurError::TransientRead(format!("unreadable buffer: {e}")))?;
        let stride = usize::try_from(info.stride()[0])
            .map_err(|_| OurError::TransientRead("negative row stride".to_string()))?;

        let frame = Frame::from_strided(info.height(), info.width(), 3, stride, map.as_slice())?;
        self.report.width = Some(info.width());
        self.report.height = Some(info.height());
        Ok(frame)
    }

    fn apply_format(&mut self, width: u32, height: u32, fps: u32) -> OurResult<()> {
        // size and rate are already fixed by the launch line's caps
        debug!("GStreamer pipeline keeps its caps, ignoring {width}x{height}@{fps}fps");
        Ok(())
    }

    fn minimize_buffering(&mut self) -> OurResult<()> {
        self.sink.set_max_buffers(1);
        self.sink.set_drop(true);
        Ok(())
    }

    fn report(&self) -> DeviceReport {
        self.report.clone()
    }

    fn release_handle(&self) -> Option<ReleaseHandle> {
        let pipeline = self.pipeline.clone();
        Some(Arc::new(move || {
            if let Err(e) = pipeline.set_state(State::Null) {
                warn!("Failed to tear down pipeline: {e:?}");
            }
        }))
    }
}

impl Drop for GstDevice {
    fn drop(&mut self) {
        if let Err(e) = self.pipeline.set_state(State::Null) {
            warn!("Failed to stop pipeline: {e:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_LINE: &str =
        "videotestsrc is-live=true ! video/x-raw, format=RGB, width=10, height=6 ! appsink name=sink";

    #[test]
    fn test_expected_report_follows_descriptor() {
        let csi = DeviceDescriptor::Csi {
            sensor_id: 0,
            width: 1280,
            height: 720,
            fps: 60,
        };
        let report = expected_report(&csi);
        assert_eq!(report.fps, Some(60.0));
        assert_eq!((report.width, report.height), (Some(1280), Some(720)));

        let ip = DeviceDescriptor::Ip {
            location: "rtsp://10.0.0.5/live".to_string(),
            width: 640,
            height: 480,
        };
        assert_eq!(expected_report(&ip).fps, None);
    }

    #[test]
    fn test_launch_reads_rgb_frames() {
        GstBackend::new().expect("gstreamer available");
        let mut device = launch(TEST_LINE, DeviceReport::default()).expect("test source plays");
        device.minimize_buffering().expect("appsink configured");

        let frame = device.read_frame().expect("sample arrives");
        // 10 RGB pixels pad to a 32 byte row
        assert_eq!(frame.shape(), (6, 10, 3));
        assert_eq!(device.report().width, Some(10));
    }

    #[test]
    fn test_release_ends_reads() {
        GstBackend::new().expect("gstreamer available");
        let mut device = launch(TEST_LINE, DeviceReport::default()).expect("test source plays");
        device.read_frame().expect("sample arrives");

        let release = device.release_handle().expect("pipelines can be torn down");
        release();
        assert!(matches!(
            device.read_frame(),
            Err(OurError::TransientRead(_))
        ));
    }

    #[test]
    fn test_missing_appsink_is_rejected() {
        GstBackend::new().expect("gstreamer available");
        assert!(launch("videotestsrc ! fakesink", DeviceReport::default()).is_err());
    }
}
