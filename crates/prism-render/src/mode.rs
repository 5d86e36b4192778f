//! Render modes and the strategy they are driven through.

use crate::camera::CameraUniforms;
use ash::vk;
use prism_gpu::{GpuContext, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Filter parameters of the spatiotemporal denoiser.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DenoiseSettings {
    /// Weight of the new frame in the color history.
    pub temporal_alpha: f32,
    /// Weight of the new frame in the moments history.
    pub moments_alpha: f32,
    /// À-trous wavelet passes; pass `i` uses a step of `2^i` pixels.
    pub atrous_iterations: u32,
    /// Luminance edge-stopping strength.
    pub phi_color: f32,
    /// Normal edge-stopping exponent.
    pub phi_normal: f32,
    /// Depth edge-stopping strength.
    pub phi_depth: f32,
}

impl Default for DenoiseSettings {
    fn default() -> Self {
        Self {
            temporal_alpha: 0.2,
            moments_alpha: 0.2,
            atrous_iterations: 5,
            phi_color: 4.0,
            phi_normal: 128.0,
            phi_depth: 1.0,
        }
    }
}

impl DenoiseSettings {
    /// Settings with blend weights clamped to `[0, 1]`, at least one
    /// filter pass and non-negative edge-stopping terms.
    pub fn clamped(self) -> Self {
        Self {
            temporal_alpha: self.temporal_alpha.clamp(0.0, 1.0),
            moments_alpha: self.moments_alpha.clamp(0.0, 1.0),
            atrous_iterations: self.atrous_iterations.max(1),
            phi_color: self.phi_color.max(0.0),
            phi_normal: self.phi_normal.max(0.0),
            phi_depth: self.phi_depth.max(0.0),
        }
    }

    /// Push constants for filter pass `iteration`.
    pub fn push_constants(&self, iteration: u32) -> DenoisePushConstants {
        DenoisePushConstants {
            temporal_alpha: self.temporal_alpha,
            moments_alpha: self.moments_alpha,
            phi_color: self.phi_color,
            phi_normal: self.phi_normal,
            phi_depth: self.phi_depth,
            step_size: 1 << iteration.min(31),
            iteration,
            _pad: 0,
        }
    }
}

/// Per-pass push constants of the denoiser shaders.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct DenoisePushConstants {
    pub temporal_alpha: f32,
    pub moments_alpha: f32,
    pub phi_color: f32,
    pub phi_normal: f32,
    pub phi_depth: f32,
    pub step_size: u32,
    pub iteration: u32,
    pub _pad: u32,
}

/// How frames are produced, chosen once at startup.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum RenderMode {
    /// Classic raster pipeline.
    Rasterize,
    /// One ray-traced sample per pixel.
    #[default]
    RayTrace,
    /// Ray tracing followed by reprojection and filtering.
    Denoise(DenoiseSettings),
}

impl RenderMode {
    /// Whether the device must support ray tracing.
    pub fn requires_ray_tracing(&self) -> bool {
        !matches!(self, Self::Rasterize)
    }

    /// Whether last frame's camera and history buffers are read.
    pub fn uses_history(&self) -> bool {
        matches!(self, Self::Denoise(_))
    }

    /// Short name, as accepted by [`FromStr`].
    pub fn name(&self) -> &'static str {
        match self {
            Self::Rasterize => "raster",
            Self::RayTrace => "rt",
            Self::Denoise(_) => "denoise",
        }
    }
}

impl fmt::Display for RenderMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Unknown render mode name.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown render mode '{0}' (expected raster, rt or denoise)")]
pub struct ParseRenderModeError(pub String);

impl FromStr for RenderMode {
    type Err = ParseRenderModeError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raster" | "rasterize" => Ok(Self::Rasterize),
            "rt" | "raytrace" | "ray-trace" => Ok(Self::RayTrace),
            "denoise" | "svgf" => Ok(Self::Denoise(DenoiseSettings::default())),
            _ => Err(ParseRenderModeError(s.to_string())),
        }
    }
}

/// Per-frame input shared by every render path.
#[derive(Clone, Copy, Debug)]
pub struct FrameInfo {
    pub index: u64,
    /// Seconds since start.
    pub time: f32,
    pub extent: vk::Extent2D,
    pub camera: CameraUniforms,
}

/// A way of producing frames.
///
/// Each [`RenderMode`] is one implementation; the application picks it at
/// startup and drives it frame by frame.
pub trait RenderPath {
    /// The mode this path implements.
    fn mode(&self) -> RenderMode;

    /// CPU-side work before the frame is recorded, such as refitting
    /// acceleration structures or uploading uniforms.
    fn prepare_frame(&mut self, ctx: &GpuContext, frame: &FrameInfo) -> Result<()>;

    /// React to a new output size.
    fn resize(&mut self, _ctx: &GpuContext, _extent: vk::Extent2D) -> Result<()> {
        Ok(())
    }

    /// Release GPU resources owned by the path.
    fn destroy(self: Box<Self>, ctx: &GpuContext) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_modes() {
        assert_eq!("raster".parse(), Ok(RenderMode::Rasterize));
        assert_eq!("RT".parse(), Ok(RenderMode::RayTrace));
        assert_eq!(
            "svgf".parse(),
            Ok(RenderMode::Denoise(DenoiseSettings::default()))
        );
        assert_eq!(
            "path".parse::<RenderMode>(),
            Err(ParseRenderModeError("path".to_string()))
        );
    }

    #[test]
    fn names_round_trip() {
        for mode in [
            RenderMode::Rasterize,
            RenderMode::RayTrace,
            RenderMode::Denoise(DenoiseSettings::default()),
        ] {
            assert_eq!(mode.to_string().parse(), Ok(mode));
        }
    }

    #[test]
    fn only_raster_skips_ray_tracing() {
        assert!(!RenderMode::Rasterize.requires_ray_tracing());
        assert!(RenderMode::RayTrace.requires_ray_tracing());
        assert!(RenderMode::Denoise(DenoiseSettings::default()).requires_ray_tracing());
        assert!(RenderMode::Denoise(DenoiseSettings::default()).uses_history());
        assert!(!RenderMode::RayTrace.uses_history());
    }

    #[test]
    fn clamping_fixes_out_of_range_settings() {
        let settings = DenoiseSettings {
            temporal_alpha: 1.5,
            moments_alpha: -0.1,
            atrous_iterations: 0,
            phi_color: -1.0,
            ..DenoiseSettings::default()
        }
        .clamped();

        assert_eq!(settings.temporal_alpha, 1.0);
        assert_eq!(settings.moments_alpha, 0.0);
        assert_eq!(settings.atrous_iterations, 1);
        assert_eq!(settings.phi_color, 0.0);
        assert_eq!(settings.phi_normal, 128.0);
    }

    #[test]
    fn atrous_step_doubles_per_pass() {
        let settings = DenoiseSettings::default();
        let steps: Vec<u32> = (0..settings.atrous_iterations)
            .map(|i| settings.push_constants(i).step_size)
            .collect();
        assert_eq!(steps, vec![1, 2, 4, 8, 16]);
        assert_eq!(std::mem::size_of::<DenoisePushConstants>(), 32);
    }
}
