//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame, FrameError};
use std::io;
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::capability::Flags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::{Format, FourCC};

const REQUESTED_WIDTH: u32 = 640;
const REQUESTED_HEIGHT: u32 = 480;
const STREAM_BUFFERS: u32 = 4;

/// Formats requested in order. Drivers may answer with something else;
/// any format [`PixelFormat`] understands is accepted.
const PREFERRED_FOURCCS: [&[u8; 4]; 2] = [b"YUYV", b"MJPG"];

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("no camera at {0}")]
    NotFound(String),
    #[error("{0} is in use by another process")]
    Busy(String),
    #[error("cannot open {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("{0} is not a video capture device")]
    NotCapture(String),
    #[error("pixel format negotiation failed: {0}")]
    Format(String),
    #[error("frame read failed: {0}")]
    Read(String),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// A source of RGB frames. The streaming pipeline owns exactly one while
/// running; dropping it releases the underlying device.
pub trait FrameSource: Send {
    /// Block until the next frame is available.
    fn next_frame(&mut self) -> Result<Frame, CameraError>;
}

/// A capture device found under `/dev`.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Pixel layouts the camera can deliver and we can convert to RGB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed.
    Yuyv,
    /// Motion-JPEG, one JPEG per buffer.
    Mjpeg,
    /// Packed 24-bit RGB.
    Rgb3,
    /// 8-bit grayscale (IR cameras).
    Grey,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"MJPG" => Some(Self::Mjpeg),
            b"RGB3" => Some(Self::Rgb3),
            b"GREY" => Some(Self::Grey),
            _ => None,
        }
    }
}

/// Classify an OS error from opening or streaming `path`.
fn open_error(path: &str, e: io::Error) -> CameraError {
    match e.raw_os_error() {
        Some(libc::EBUSY) => CameraError::Busy(path.to_string()),
        Some(libc::ENOENT) | Some(libc::ENODEV) | Some(libc::ENXIO) => {
            CameraError::NotFound(path.to_string())
        }
        _ => CameraError::Open {
            path: path.to_string(),
            source: e,
        },
    }
}

/// Ask for each preferred format in turn and keep the first answer we can
/// decode. Returns the negotiated width, height and layout.
fn negotiate(device: &Device, path: &str) -> Result<(u32, u32, PixelFormat), CameraError> {
    let mut answers = Vec::new();
    for wanted in PREFERRED_FOURCCS {
        let request = Format::new(REQUESTED_WIDTH, REQUESTED_HEIGHT, FourCC::new(wanted));
        let got = device
            .set_format(&request)
            .map_err(|e| CameraError::Format(format!("{path}: {e}")))?;
        if let Some(layout) = PixelFormat::from_fourcc(got.fourcc) {
            return Ok((got.width, got.height, layout));
        }
        tracing::debug!(
            device = path,
            requested = ?request.fourcc,
            got = ?got.fourcc,
            "format refused"
        );
        answers.push(format!("{:?}", got.fourcc));
    }
    Err(CameraError::Format(format!(
        "{path} only offers {}; need YUYV, MJPG, RGB3 or GREY",
        answers.join(", ")
    )))
}

/// An open V4L2 capture device that is streaming into mmap buffers.
pub struct Camera {
    // Dropped before `device` so streaming stops before the fd closes.
    stream: MmapStream<'static>,
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub pixel_format: PixelFormat,
}

impl Camera {
    /// Open `device_path`, negotiate a format and start streaming.
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::NotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| open_error(device_path, e))?;
        let caps = device
            .query_caps()
            .map_err(|e| open_error(device_path, e))?;
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            return Err(CameraError::NotCapture(device_path.to_string()));
        }

        let (width, height, pixel_format) = negotiate(&device, device_path)?;
        let stream = MmapStream::with_buffers(&device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| open_error(device_path, e))?;

        tracing::info!(
            device = device_path,
            card = %caps.card,
            width,
            height,
            format = ?pixel_format,
            "camera streaming"
        );

        Ok(Self {
            stream,
            device,
            width,
            height,
            device_path: device_path.to_string(),
            pixel_format,
        })
    }

    /// Driver and card name, for diagnostics.
    pub fn describe(&self) -> String {
        match self.device.query_caps() {
            Ok(caps) => format!("{} ({})", caps.card, caps.driver),
            Err(_) => self.device_path.clone(),
        }
    }

    /// Capture-capable `/dev/video*` nodes, sorted by path.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let Ok(entries) = std::fs::read_dir("/dev") else {
            return Vec::new();
        };
        let mut paths: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with("video"))
            .map(|entry| entry.path().to_string_lossy().into_owned())
            .collect();
        paths.sort();

        paths
            .into_iter()
            .filter_map(|path| {
                let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
                if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
                    return None;
                }
                Some(DeviceInfo {
                    path,
                    name: caps.card,
                    driver: caps.driver,
                    bus: caps.bus,
                })
            })
            .collect()
    }
}

impl FrameSource for Camera {
    fn next_frame(&mut self) -> Result<Frame, CameraError> {
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| CameraError::Read(e.to_string()))?;

        let (w, h) = (self.width, self.height);
        let image = match self.pixel_format {
            PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, w, h)?,
            PixelFormat::Mjpeg => {
                let used = (meta.bytesused as usize).min(buf.len());
                frame::mjpeg_to_rgb(&buf[..used])?
            }
            PixelFormat::Rgb3 => frame::rgb24(buf, w, h)?,
            PixelFormat::Grey => frame::grey_to_rgb(buf, w, h)?,
        };

        Ok(Frame::new(image, meta.sequence))
    }
}
