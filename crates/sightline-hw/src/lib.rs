//! sightline-hw: Camera capture and frame handling.
//!
//! Provides V4L2 capture into RGB frames plus the downsampling and drawing
//! primitives the recognition pipeline needs.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, FrameSource, PixelFormat};
pub use frame::{Frame, FrameError};
