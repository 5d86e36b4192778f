//! Render-mode selection and per-frame view state for the Prism renderer.
//!
//! This crate provides:
//! - [`RenderMode`], chosen once at startup, and the [`RenderPath`] strategy
//!   each mode is driven through
//! - Denoiser settings for the ray-traced reprojection path
//! - Camera and view management, including last frame's matrices

pub mod camera;
pub mod mode;

pub use camera::{Camera, CameraUniforms};
pub use mode::{
    DenoisePushConstants, DenoiseSettings, FrameInfo, ParseRenderModeError, RenderMode,
    RenderPath,
};
