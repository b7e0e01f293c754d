use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::Args;
use tracing::info;

use crate::builder::{PyramidBuilder, PyramidConfig};
use crate::core::face::{FaceImage, FaceName};
use crate::core::jpeg::create_encoder;
use crate::core::levels::ResolutionLevel;
use crate::core::pyramid::{discover_pyramid, verify_pyramid};
use crate::core::ResampleFilter;

/// Pyramid settings shared by `build` and `serve`.
#[derive(Args, Debug, Clone)]
pub struct PyramidArgs {
    /// Directory holding one sub-directory of tiles per panorama
    #[arg(long, default_value = "panoramas")]
    pub storage_root: PathBuf,

    /// JPEG quality for every tile
    #[arg(long, default_value_t = 80)]
    pub quality: u8,

    /// Resample filter for level downscaling: bilinear, bicubic, lanczos3
    #[arg(long, default_value = "lanczos3")]
    pub filter: String,

    /// Encoder backend
    #[arg(long, default_value = "image")]
    pub encoder: String,

    /// Give up on a build that has not completed after this many seconds
    #[arg(long, default_value_t = 300)]
    pub build_timeout_secs: u64,
}

impl PyramidArgs {
    pub fn to_config(&self) -> Result<PyramidConfig> {
        let filter: ResampleFilter = self.filter.parse().map_err(|e: String| anyhow!(e))?;
        if !(1..=100).contains(&self.quality) {
            return Err(anyhow!("--quality must be within 1..=100, got {}", self.quality));
        }
        if self.build_timeout_secs == 0 {
            return Err(anyhow!("--build-timeout-secs must be positive"));
        }
        Ok(PyramidConfig {
            storage_root: self.storage_root.clone(),
            quality: self.quality,
            filter,
            timeout: Duration::from_secs(self.build_timeout_secs),
        })
    }

    pub fn to_builder(&self) -> Result<PyramidBuilder> {
        let encoder = create_encoder(&self.encoder)?;
        Ok(PyramidBuilder::new(self.to_config()?).with_encoder(encoder.into()))
    }
}

#[derive(Args, Debug)]
pub struct BuildArgs {
    #[command(flatten)]
    pub pyramid: PyramidArgs,

    /// Directory containing the six faces, named up/down/front/back/left/right
    /// with any image extension
    #[arg(long)]
    pub faces: PathBuf,

    /// Panorama id; becomes the pyramid's directory name
    #[arg(long)]
    pub id: String,

    /// Face edge in pixels (default: read from the first face)
    #[arg(long)]
    pub size: Option<u32>,

    /// Re-read the tile tree afterwards and check every expected tile exists
    #[arg(long)]
    pub verify: bool,
}

/// Load the face files found in `dir`, skipping anything not named after a face.
pub fn load_faces(dir: &Path) -> Result<Vec<FaceImage>> {
    let mut faces = Vec::new();
    let mut entries: Vec<_> = fs::read_dir(dir)
        .with_context(|| format!("reading faces directory {}", dir.display()))?
        .collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy().to_string();
        if FaceName::from_file_name(&file_name).is_err() {
            info!("skipping {} (not a cube face name)", path.display());
            continue;
        }
        let bytes = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        faces.push(FaceImage::new(file_name, bytes));
    }
    Ok(faces)
}

/// Rediscover a finished pyramid from disk and check it against `levels`.
pub fn verify_build(root: &Path, panorama_id: &str, levels: &[ResolutionLevel]) -> Result<usize> {
    let found = discover_pyramid(root, panorama_id)?;
    if found.level_count != levels.len() {
        return Err(anyhow!(
            "{} has {} level directories, expected {}",
            found.panorama_dir.display(),
            found.level_count,
            levels.len()
        ));
    }
    if found.faces.len() != FaceName::ALL.len() {
        return Err(anyhow!(
            "{} has faces {:?}, expected all six",
            found.panorama_dir.display(),
            found.faces
        ));
    }
    let tiles = verify_pyramid(root, panorama_id, levels, &found.faces)?;
    info!("Verified {} tiles under {}", tiles, found.panorama_dir.display());
    Ok(tiles)
}

pub fn run(args: BuildArgs) -> Result<()> {
    let start = Instant::now();
    let builder = args.pyramid.to_builder()?;
    let faces = load_faces(&args.faces)?;
    info!("Loaded {} faces from {}", faces.len(), args.faces.display());

    let size = match args.size {
        Some(size) => size,
        None => {
            let first = faces
                .first()
                .ok_or_else(|| anyhow!("no face images found in {}", args.faces.display()))?;
            let img = image::load_from_memory(&first.bytes)
                .with_context(|| format!("decoding {}", first.file_name))?;
            img.width()
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let levels = runtime.block_on(builder.build_pyramid(&args.id, faces, size))?;

    if args.verify {
        verify_build(&builder.config().storage_root, &args.id, &levels)?;
    }

    info!(
        "Build complete: id={} levels={} {:.1}s",
        args.id,
        levels.len(),
        start.elapsed().as_secs_f64()
    );
    println!("{}", serde_json::to_string_pretty(&levels)?);
    Ok(())
}
