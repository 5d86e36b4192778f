//! Command line options.

use anyhow::{bail, Context};
use prism_core::constants::MIB;
use prism_gpu::memory::DEFAULT_CHUNK_SIZE;
use prism_render::RenderMode;

pub const USAGE: &str = "\
Usage: prism-bench [OPTIONS]

Options:
  --grid <N>            Cubes per side of the procedural grid [default: 16]
  --frames <N>          Animated frames to refit the TLAS for [default: 120]
  --no-compaction       Skip BLAS compaction
  --chunk-size-mb <N>   Default device memory chunk size in MiB [default: 256]
  --mode <MODE>         raster, rt or denoise [default: rt]
  --no-validation       Disable the Vulkan validation layers
  -h, --help            Print this help

Log filtering follows RUST_LOG (default: info).";

#[derive(Clone, Debug, PartialEq)]
pub struct BenchArgs {
    pub grid: u32,
    pub frames: u32,
    pub compaction: bool,
    pub chunk_size: u64,
    pub mode: RenderMode,
    pub validation: bool,
}

impl Default for BenchArgs {
    fn default() -> Self {
        Self {
            grid: 16,
            frames: 120,
            compaction: true,
            chunk_size: DEFAULT_CHUNK_SIZE,
            mode: RenderMode::default(),
            validation: cfg!(debug_assertions),
        }
    }
}

impl BenchArgs {
    /// Parse arguments, not including the program name.
    ///
    /// Returns `None` when help was requested.
    pub fn parse(args: impl IntoIterator<Item = String>) -> anyhow::Result<Option<Self>> {
        let mut parsed = Self::default();
        let mut args = args.into_iter();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-h" | "--help" => return Ok(None),
                "--no-compaction" => parsed.compaction = false,
                "--no-validation" => parsed.validation = false,
                "--grid" => parsed.grid = parse_value(&arg, args.next())?,
                "--frames" => parsed.frames = parse_value(&arg, args.next())?,
                "--chunk-size-mb" => {
                    let mb: u64 = parse_value(&arg, args.next())?;
                    if mb == 0 {
                        bail!("--chunk-size-mb must be at least 1");
                    }
                    parsed.chunk_size = mb
                        .checked_mul(MIB)
                        .context("--chunk-size-mb is too large")?;
                }
                "--mode" => {
                    let value = args.next().context("--mode needs a value")?;
                    parsed.mode = value.parse()?;
                }
                other => bail!("Unknown argument '{other}'\n\n{USAGE}"),
            }
        }

        if parsed.grid == 0 {
            bail!("--grid must be at least 1");
        }
        Ok(Some(parsed))
    }
}

fn parse_value<T>(flag: &str, value: Option<String>) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let value = value.with_context(|| format!("{flag} needs a value"))?;
    value
        .parse()
        .with_context(|| format!("Invalid value '{value}' for {flag}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use prism_render::DenoiseSettings;

    fn parse(args: &[&str]) -> anyhow::Result<Option<BenchArgs>> {
        BenchArgs::parse(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn no_arguments_gives_defaults() {
        assert_eq!(parse(&[]).unwrap(), Some(BenchArgs::default()));
    }

    #[test]
    fn every_flag_is_applied() {
        let args = parse(&[
            "--grid",
            "4",
            "--frames",
            "10",
            "--no-compaction",
            "--chunk-size-mb",
            "64",
            "--mode",
            "denoise",
            "--no-validation",
        ])
        .unwrap()
        .unwrap();

        assert_eq!(args.grid, 4);
        assert_eq!(args.frames, 10);
        assert!(!args.compaction);
        assert_eq!(args.chunk_size, 64 * MIB);
        assert_eq!(args.mode, RenderMode::Denoise(DenoiseSettings::default()));
        assert!(!args.validation);
    }

    #[test]
    fn help_stops_parsing() {
        assert_eq!(parse(&["--grid", "4", "-h", "--bogus"]).unwrap(), None);
    }

    #[test]
    fn bad_input_is_reported() {
        assert!(parse(&["--grid"]).is_err());
        assert!(parse(&["--grid", "0"]).is_err());
        assert!(parse(&["--frames", "many"]).is_err());
        assert!(parse(&["--chunk-size-mb", "0"]).is_err());
        assert!(parse(&["--mode", "path"]).is_err());
        assert!(parse(&["--fast"]).is_err());
    }
}
