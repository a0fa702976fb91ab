//! V4L2 producer using the v4l crate.
//!
//! The source path is a directory of device nodes (normally `/dev`); every
//! `video*` node that supports capture and streaming is listed.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;
use v4l::buffer::Type;
use v4l::capability::Flags;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream as V4lCaptureStream;
use v4l::video::Capture;
use v4l::Device;

use crate::error::{AcquireError, CaptureError, Result};
use crate::traits::{DeviceHandle, DeviceInfo, Format, FrameBuffer, Producer};

/// Driver buffers requested per stream.
const DEFAULT_BUFFER_COUNT: u32 = 4;
/// Longest a single `fill_buffer` call waits for the driver.
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(500);

const ENXIO: i32 = 6;
const EBUSY: i32 = 16;
const ENODEV: i32 = 19;

/// Producer listing the V4L2 capture nodes of one directory.
#[derive(Debug, Clone)]
pub struct V4l2Producer {
    root: PathBuf,
    buffer_count: u32,
    poll_timeout: Duration,
}

impl V4l2Producer {
    /// Use the device nodes under `root`.
    pub fn open(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(AcquireError::SourceLoad {
                path: root.to_path_buf(),
                reason: "not a device directory".to_owned(),
            });
        }
        Ok(Self {
            root: root.to_path_buf(),
            buffer_count: DEFAULT_BUFFER_COUNT,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        })
    }

    fn video_nodes(&self) -> io::Result<Vec<PathBuf>> {
        let mut nodes: Vec<PathBuf> = fs::read_dir(&self.root)?
            .filter_map(std::result::Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().starts_with("video"))
            .map(|entry| entry.path())
            .collect();
        nodes.sort();
        Ok(nodes)
    }

    fn describe(&self, node: &Path) -> io::Result<Option<DeviceInfo>> {
        let device = Device::with_path(node)?;
        let caps = device.query_caps()?;
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE | Flags::STREAMING) {
            return Ok(None);
        }
        Ok(Some(DeviceInfo {
            id: node.to_string_lossy().into_owned(),
            vendor: caps.driver,
            model: caps.card,
            serial_number: caps.bus,
            source: self.root.clone(),
        }))
    }
}

impl Producer for V4l2Producer {
    fn list_devices(&self) -> Result<Vec<DeviceInfo>> {
        let nodes = self.video_nodes().map_err(|err| {
            AcquireError::Discovery(format!("cannot read {}: {err}", self.root.display()))
        })?;

        let mut devices = Vec::new();
        for node in nodes {
            match self.describe(&node) {
                Ok(Some(info)) => devices.push(info),
                Ok(None) => debug!(node = %node.display(), "skipping non-capture node"),
                Err(err) => debug!(node = %node.display(), error = %err, "skipping unreadable node"),
            }
        }
        Ok(devices)
    }

    fn open_device(&self, info: &DeviceInfo) -> Result<Box<dyn DeviceHandle>> {
        let open_error = |err: io::Error| match err.raw_os_error() {
            Some(EBUSY) => AcquireError::DeviceBusy(info.id.clone()),
            _ => AcquireError::DeviceUnreachable {
                device: info.id.clone(),
                reason: err.to_string(),
            },
        };

        let device = Device::with_path(&info.id).map_err(open_error)?;
        let fmt = device.format().map_err(open_error)?;
        let mut stream = Stream::with_buffers(&device, Type::VideoCapture, self.buffer_count)
            .map_err(open_error)?;
        stream.set_timeout(self.poll_timeout);

        Ok(Box::new(V4l2Handle {
            stream: Some(stream),
            _device: device,
            format: Format {
                width: fmt.width,
                height: fmt.height,
                fourcc: fmt.fourcc.into(),
                size: fmt.size,
            },
        }))
    }
}

/// Open V4L2 node streaming through mmap buffers.
struct V4l2Handle {
    // Declared before the device so the stream is turned off first.
    stream: Option<Stream<'static>>,
    _device: Device,
    format: Format,
}

impl DeviceHandle for V4l2Handle {
    fn fill_buffer(&mut self, buffer: &mut FrameBuffer) -> std::result::Result<(), CaptureError> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(CaptureError::Fatal("stream already closed".to_owned()));
        };
        let (data, meta) = stream.next().map_err(classify)?;

        buffer.data.clear();
        buffer.data.extend_from_slice(data);

        // V4L2 timestamps are never negative in practice
        let secs = u64::try_from(meta.timestamp.sec).unwrap_or_default();
        let micros = u64::try_from(meta.timestamp.usec).unwrap_or_default();
        buffer.metadata.timestamp = Duration::from_secs(secs) + Duration::from_micros(micros);
        buffer.metadata.device_sequence = u64::from(meta.sequence);
        buffer.metadata.bytes_used = (meta.bytesused as usize).min(buffer.data.len());
        buffer.metadata.format = Some(self.format);
        Ok(())
    }

    fn close(&mut self) {
        self.stream = None;
    }
}

/// Disconnects end the capture loop; everything else is retried.
fn classify(err: io::Error) -> CaptureError {
    match err.raw_os_error() {
        Some(ENODEV | ENXIO) => CaptureError::Fatal(err.to_string()),
        _ => CaptureError::Transient(err.to_string()),
    }
}
