//! Render paths driven by the benchmark.
//!
//! No pixels are produced; each path does the per-frame CPU and transfer
//! work its mode needs so that the build and refit costs can be measured.

use std::time::{Duration, Instant};

use anyhow::Context;
use ash::vk;
use prism_core::{grid_cube_nodes, ProceduralGrid, SceneData, SceneSource};
use prism_gpu::{GpuBuffer, GpuContext};
use prism_render::{CameraUniforms, DenoiseSettings, FrameInfo, RenderMode, RenderPath};
use prism_rt::{
    upload_scene, BlasBuildConfig, GpuMesh, RayTracingBuilder, TlasBuildConfig, TlasInstance,
};

/// Scene state shared by every path.
struct GridScene {
    grid: ProceduralGrid,
    scene: SceneData,
    meshes: Vec<GpuMesh>,
    camera_buffer: GpuBuffer,
}

impl GridScene {
    fn load(ctx: &GpuContext, grid: ProceduralGrid) -> anyhow::Result<Self> {
        let scene = grid
            .load()
            .with_context(|| format!("Failed to load {}", grid.name()))?;
        let meshes = upload_scene(ctx, &scene).context("Failed to upload scene geometry")?;
        let camera_buffer = ctx
            .create_buffer(
                std::mem::size_of::<CameraUniforms>() as u64,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                "camera uniforms",
            )
            .context("Failed to create camera buffer")?;

        Ok(Self {
            grid,
            scene,
            meshes,
            camera_buffer,
        })
    }

    fn animate(&mut self, time: f32) -> prism_gpu::Result<()> {
        let poses: Vec<_> = grid_cube_nodes(&self.grid)
            .map(|(node, x, z)| (node, self.grid.cube_transform(x, z, time)))
            .collect();
        for (node, transform) in poses {
            self.scene
                .graph
                .set_local_transform(node, transform)
                .map_err(|e| prism_gpu::GpuError::InvalidState(e.to_string()))?;
        }
        Ok(())
    }

    fn tlas_instances(&self) -> Vec<TlasInstance> {
        self.scene
            .instances()
            .iter()
            .map(TlasInstance::from_scene_instance)
            .collect()
    }

    fn destroy(self, ctx: &GpuContext) -> prism_gpu::Result<()> {
        ctx.free_buffer(self.camera_buffer)?;
        for mesh in self.meshes {
            mesh.destroy(ctx)?;
        }
        Ok(())
    }
}

/// Raster mode: only camera uniforms change per frame.
pub struct RasterPath {
    scene: GridScene,
}

impl RasterPath {
    pub fn new(ctx: &GpuContext, grid: ProceduralGrid) -> anyhow::Result<Self> {
        Ok(Self {
            scene: GridScene::load(ctx, grid)?,
        })
    }
}

impl RenderPath for RasterPath {
    fn mode(&self) -> RenderMode {
        RenderMode::Rasterize
    }

    fn prepare_frame(&mut self, _ctx: &GpuContext, frame: &FrameInfo) -> prism_gpu::Result<()> {
        self.scene.animate(frame.time)?;
        self.scene.camera_buffer.write(&[frame.camera])
    }

    fn destroy(self: Box<Self>, ctx: &GpuContext) -> prism_gpu::Result<()> {
        self.scene.destroy(ctx)
    }
}

/// Ray-traced modes: the TLAS is refit every frame.
pub struct RayTracePath {
    mode: RenderMode,
    scene: GridScene,
    builder: RayTracingBuilder,
    refit_time: Duration,
    refits: u32,
}

impl RayTracePath {
    /// Upload the grid and build every acceleration structure.
    pub fn new(
        ctx: &GpuContext,
        mode: RenderMode,
        grid: ProceduralGrid,
        blas_config: BlasBuildConfig,
    ) -> anyhow::Result<Self> {
        let scene = GridScene::load(ctx, grid)?;
        let inputs: Vec<_> = scene
            .meshes
            .iter()
            .map(|mesh| mesh.blas_input(ctx.device()))
            .collect();

        let mut builder = RayTracingBuilder::new(blas_config, TlasBuildConfig::default());
        let start = Instant::now();
        let report = builder
            .build_blas(ctx, &inputs)
            .context("Failed to build BLAS")?;
        tracing::info!(
            blas = report.count,
            sub_batches = report.sub_batches,
            scratch_bytes = report.scratch_size,
            elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
            "BLAS ready"
        );

        let start = Instant::now();
        builder
            .build_tlas(ctx, &scene.tlas_instances(), false)
            .context("Failed to build TLAS")?;
        tracing::info!(
            instances = scene.scene.instances().len(),
            elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
            "TLAS ready"
        );

        Ok(Self {
            mode,
            scene,
            builder,
            refit_time: Duration::ZERO,
            refits: 0,
        })
    }

    /// Mean wall time of one TLAS refit, including the queue wait.
    pub fn mean_refit_time(&self) -> Duration {
        self.refit_time
            .checked_div(self.refits)
            .unwrap_or(Duration::ZERO)
    }

    fn denoise_settings(&self) -> Option<DenoiseSettings> {
        match self.mode {
            RenderMode::Denoise(settings) => Some(settings.clamped()),
            _ => None,
        }
    }
}

impl RenderPath for RayTracePath {
    fn mode(&self) -> RenderMode {
        self.mode
    }

    fn prepare_frame(&mut self, ctx: &GpuContext, frame: &FrameInfo) -> prism_gpu::Result<()> {
        self.scene.animate(frame.time)?;

        let start = Instant::now();
        self.builder
            .build_tlas(ctx, &self.scene.tlas_instances(), true)?;
        self.refit_time += start.elapsed();
        self.refits += 1;

        self.scene.camera_buffer.write(&[frame.camera])?;

        if let Some(settings) = self.denoise_settings() {
            for iteration in 0..settings.atrous_iterations {
                let constants = settings.push_constants(iteration);
                tracing::trace!(
                    frame = frame.index,
                    iteration,
                    step = constants.step_size,
                    "A-trous pass"
                );
            }
        }
        Ok(())
    }

    fn destroy(self: Box<Self>, ctx: &GpuContext) -> prism_gpu::Result<()> {
        if self.refits > 0 {
            tracing::info!(
                refits = self.refits,
                mean_ms = self.mean_refit_time().as_secs_f64() * 1000.0,
                "TLAS refit timing"
            );
        }
        self.builder.destroy(ctx)?;
        self.scene.destroy(ctx)
    }
}
