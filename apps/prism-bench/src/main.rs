//! Prism acceleration structure benchmark.
//!
//! Builds a procedural grid scene headlessly, then animates it for a number
//! of frames through the render path of the chosen mode.

mod args;
mod paths;

use anyhow::Context;
use ash::vk;
use glam::Vec3;
use prism_core::ProceduralGrid;
use prism_gpu::{GpuContext, GpuContextBuilder};
use prism_render::{Camera, FrameInfo, RenderMode, RenderPath};
use prism_rt::BlasBuildConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::args::{BenchArgs, USAGE};
use crate::paths::{RasterPath, RayTracePath};

const EXTENT: vk::Extent2D = vk::Extent2D {
    width: 1920,
    height: 1080,
};
const FRAME_TIME: f32 = 1.0 / 60.0;

fn init_logging() {
    #[cfg(feature = "profiling-tracy")]
    {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,prism_gpu=trace,prism_rt=trace,prism_bench=trace")
        });
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .with(tracing_tracy::TracyLayer::default())
            .init();
    }
    #[cfg(not(feature = "profiling-tracy"))]
    {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .init();
    }
}

fn main() -> anyhow::Result<()> {
    let Some(args) = BenchArgs::parse(std::env::args().skip(1))? else {
        eprintln!("{USAGE}");
        return Ok(());
    };

    init_logging();
    info!(?args, "Prism benchmark");

    let ctx = GpuContextBuilder::new()
        .app_name("prism-bench")
        .validation(args.validation)
        .ray_tracing(args.mode.requires_ray_tracing())
        .default_chunk_size(args.chunk_size)
        .build()
        .context("Failed to create GPU context")?;

    let result = run(&ctx, &args);
    ctx.wait_idle().context("Failed to wait for device idle")?;
    result
}

fn run(ctx: &GpuContext, args: &BenchArgs) -> anyhow::Result<()> {
    let grid = ProceduralGrid::new(args.grid);
    let radius = grid.size as f32 * grid.spacing;

    let mut path: Box<dyn RenderPath> = match args.mode {
        RenderMode::Rasterize => Box::new(RasterPath::new(ctx, grid)?),
        mode => {
            let blas_config = if args.compaction {
                BlasBuildConfig::default()
            } else {
                BlasBuildConfig::default().without_compaction()
            };
            Box::new(RayTracePath::new(ctx, mode, grid, blas_config)?)
        }
    };
    info!(mode = %path.mode(), "Render path ready");

    let mut camera = Camera::default();
    camera.set_aspect(EXTENT.width as f32 / EXTENT.height as f32);
    path.resize(ctx, EXTENT)?;

    let frames = run_frames(ctx, path.as_mut(), &mut camera, args.frames, radius);

    log_memory(ctx);
    path.destroy(ctx)?;
    frames
}

fn run_frames(
    ctx: &GpuContext,
    path: &mut dyn RenderPath,
    camera: &mut Camera,
    frames: u32,
    radius: f32,
) -> anyhow::Result<()> {
    let start = std::time::Instant::now();

    for index in 0..frames {
        let time = index as f32 * FRAME_TIME;
        camera.orbit(Vec3::ZERO, radius, radius * 0.5, time * 0.25);

        let frame = FrameInfo {
            index: u64::from(index),
            time,
            extent: EXTENT,
            camera: camera.uniforms(),
        };
        path.prepare_frame(ctx, &frame)
            .with_context(|| format!("Frame {index} failed"))?;
        camera.end_frame();
    }

    if frames > 0 {
        let elapsed = start.elapsed();
        info!(
            frames,
            total_ms = elapsed.as_secs_f64() * 1000.0,
            per_frame_ms = elapsed.as_secs_f64() * 1000.0 / f64::from(frames),
            "Frames done"
        );
    }
    Ok(())
}

fn log_memory(ctx: &GpuContext) {
    let stats = ctx.allocator().lock().stats();
    for pool in &stats.pools {
        info!(
            memory_type = pool.memory_type_index,
            chunks = pool.chunk_count,
            blocks = pool.block_count,
            reserved_mib = pool.reserved_bytes as f64 / (1024.0 * 1024.0),
            used_mib = pool.used_bytes as f64 / (1024.0 * 1024.0),
            "Memory pool"
        );
    }
    info!(
        chunks = stats.chunk_count(),
        blocks = stats.block_count(),
        reserved_bytes = stats.reserved_bytes(),
        used_bytes = stats.used_bytes(),
        "Device memory"
    );
}
