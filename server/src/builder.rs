use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use image::RgbImage;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tokio::task::{self, JoinHandle};
use tracing::{debug, info, warn};

use crate::core::face::{decode_faces, DecodedFace, FaceImage, FaceName};
use crate::core::jpeg::{ImageJpegEncoder, JpegEncoder};
use crate::core::levels::{compute_levels, total_tiles, ResolutionLevel, MIN_LEVEL_SIZE};
use crate::core::pyramid::{extract_tile, prepare_directories, tile_path, validate_panorama_id};
use crate::core::{resize_face, ResampleFilter};
use crate::error::{PyramidError, Result};

/// Settings shared by every build a [`PyramidBuilder`] runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PyramidConfig {
    /// Directory holding one sub-directory per panorama.
    pub storage_root: PathBuf,
    pub quality: u8,
    pub filter: ResampleFilter,
    /// Upper bound on a whole build; past it the build fails as stalled.
    pub timeout: Duration,
}

impl Default for PyramidConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("panoramas"),
            quality: 80,
            filter: ResampleFilter::Lanczos3,
            timeout: Duration::from_secs(300),
        }
    }
}

/// Builds on-disk cubemap tile pyramids.
///
/// Levels are generated strictly one after another, coarsest first. Inside a
/// level every face is resized and every tile is cropped, encoded and written
/// in parallel; the level is joined before the next one starts.
pub struct PyramidBuilder {
    config: PyramidConfig,
    encoder: Arc<dyn JpegEncoder>,
}

/// Result of draining one level's tile work.
#[derive(Debug)]
struct LevelOutcome {
    written: usize,
    expected: usize,
    failed: Vec<String>,
}

/// Transient state for the level currently being generated.
struct PyramidJob {
    panorama_id: String,
    storage_root: PathBuf,
    level_index: usize,
    level: ResolutionLevel,
    faces: Arc<Vec<DecodedFace>>,
    encoder: Arc<dyn JpegEncoder>,
    quality: u8,
    filter: ResampleFilter,
    written: AtomicUsize,
    failed: Mutex<Vec<String>>,
    cancelled: Arc<AtomicBool>,
}

impl PyramidJob {
    fn expected(&self) -> usize {
        self.level.tiles_per_face() * self.faces.len()
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn write_tile(&self, face: FaceName, resized: &RgbImage, x: u32, y: u32) -> anyhow::Result<()> {
        let tile_size = self.level.tile_size;
        let tile = extract_tile(resized, x, y, tile_size);
        let jpeg = self
            .encoder
            .encode_rgb(tile.as_raw(), tile_size, tile_size, self.quality)?;
        if self.is_cancelled() {
            anyhow::bail!("build cancelled");
        }
        let path = tile_path(&self.storage_root, &self.panorama_id, self.level_index, face, x, y);
        fs::write(&path, &jpeg).map_err(|e| anyhow::anyhow!("write {}: {}", path.display(), e))?;
        Ok(())
    }

    fn record_failure(&self, msg: String) {
        warn!("{}", msg);
        self.failed.lock().unwrap().push(msg);
    }

    /// Resize, slice and write every tile of this level. Blocks until all of
    /// the level's work has drained. Once cancelled, tiles not yet started
    /// are skipped.
    fn run(self) -> LevelOutcome {
        let size = self.level.size;
        let per_axis = self.level.tiles_per_axis();

        let resized: Vec<Option<(FaceName, RgbImage)>> = self
            .faces
            .par_iter()
            .map(|f| {
                if self.is_cancelled() {
                    return None;
                }
                match resize_face(&f.pixels, size, self.filter) {
                    Ok(img) => Some((f.face, img)),
                    Err(e) => {
                        self.record_failure(format!(
                            "Error resizing face '{}' for level {}: {}",
                            f.face, self.level_index, e
                        ));
                        None
                    }
                }
            })
            .collect();

        let tiles: Vec<(usize, u32, u32)> = resized
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_some())
            .flat_map(|(i, _)| {
                (0..per_axis).flat_map(move |x| (0..per_axis).map(move |y| (i, x, y)))
            })
            .collect();

        tiles.par_iter().for_each(|&(i, x, y)| {
            if self.is_cancelled() {
                return;
            }
            let Some((face, img)) = resized[i].as_ref() else {
                return;
            };
            match self.write_tile(*face, img, x, y) {
                Ok(()) => {
                    self.written.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => self.record_failure(format!(
                    "Error on tile '{}/{}/tile-{}-{}.jpg': {}",
                    self.level_index, face, x, y, e
                )),
            }
        });

        LevelOutcome {
            written: self.written.load(Ordering::Relaxed),
            expected: self.expected(),
            failed: self.failed.into_inner().unwrap_or_default(),
        }
    }
}

impl PyramidBuilder {
    pub fn new(config: PyramidConfig) -> Self {
        Self {
            config,
            encoder: Arc::new(ImageJpegEncoder),
        }
    }

    pub fn with_encoder(mut self, encoder: Arc<dyn JpegEncoder>) -> Self {
        self.encoder = encoder;
        self
    }

    pub fn config(&self) -> &PyramidConfig {
        &self.config
    }

    /// Build the full pyramid for `panorama_id` and return its level list.
    ///
    /// Resolves once every tile of every level is on disk, or with the first
    /// terminal error. Bounded by [`PyramidConfig::timeout`]; on expiry the
    /// build fails with [`PyramidError::Stalled`], the running level stops
    /// picking up new tiles, and tiles written so far are left in place.
    pub async fn build_pyramid(
        &self,
        panorama_id: &str,
        faces: Vec<FaceImage>,
        base_size: u32,
    ) -> Result<Vec<ResolutionLevel>> {
        let limit = self.config.timeout;
        let cancelled = Arc::new(AtomicBool::new(false));
        let build = self.build_unbounded(panorama_id, faces, base_size, Arc::clone(&cancelled));
        match tokio::time::timeout(limit, build).await {
            Ok(result) => result,
            Err(_) => {
                cancelled.store(true, Ordering::Release);
                warn!("pyramid {} stalled after {:?}", panorama_id, limit);
                Err(PyramidError::Stalled(limit))
            }
        }
    }

    /// Run [`build_pyramid`](Self::build_pyramid) on the runtime and hand its
    /// outcome to `on_complete`, which is called exactly once.
    pub fn spawn<F>(
        self: &Arc<Self>,
        panorama_id: String,
        faces: Vec<FaceImage>,
        base_size: u32,
        on_complete: F,
    ) -> JoinHandle<()>
    where
        F: FnOnce(Result<Vec<ResolutionLevel>>) + Send + 'static,
    {
        let builder = Arc::clone(self);
        tokio::spawn(async move {
            let result = builder.build_pyramid(&panorama_id, faces, base_size).await;
            on_complete(result);
        })
    }

    async fn build_unbounded(
        &self,
        panorama_id: &str,
        faces: Vec<FaceImage>,
        base_size: u32,
        cancelled: Arc<AtomicBool>,
    ) -> Result<Vec<ResolutionLevel>> {
        let start = Instant::now();
        validate_panorama_id(panorama_id)?;

        let levels = compute_levels(base_size);
        if levels.is_empty() {
            return Err(PyramidError::InvalidInput(format!(
                "face size {} is below the minimum of {}",
                base_size, MIN_LEVEL_SIZE
            )));
        }
        if let Some(bad) = levels.iter().find(|l| !l.is_evenly_tiled()) {
            return Err(PyramidError::InvalidInput(format!(
                "face size {} gives level size {} which does not split into {}px tiles",
                base_size, bad.size, bad.tile_size
            )));
        }

        let decoded = task::spawn_blocking(move || decode_faces(&faces, base_size)).await??;
        let face_names: Vec<FaceName> = decoded.iter().map(|f| f.face).collect();
        let faces = Arc::new(decoded);

        let root = self.config.storage_root.clone();
        let id = panorama_id.to_string();
        let level_count = levels.len();
        let dirs = task::spawn_blocking(move || {
            prepare_directories(&root, &id, level_count, &face_names)
        })
        .await??;
        debug!("pyramid {} prepared {} directories", panorama_id, dirs.len());

        info!(
            "pyramid {} base_size={} levels={} total_tiles={}",
            panorama_id,
            base_size,
            levels.len(),
            total_tiles(&levels, faces.len())
        );

        for (level_index, &level) in levels.iter().enumerate() {
            let job = PyramidJob {
                panorama_id: panorama_id.to_string(),
                storage_root: self.config.storage_root.clone(),
                level_index,
                level,
                faces: Arc::clone(&faces),
                encoder: Arc::clone(&self.encoder),
                quality: self.config.quality,
                filter: self.config.filter,
                written: AtomicUsize::new(0),
                failed: Mutex::new(Vec::new()),
                cancelled: Arc::clone(&cancelled),
            };
            info!(
                "Generating {} cube tiles for {} cubemap faces for level {}",
                job.expected(),
                faces.len(),
                level_index
            );
            let level_start = Instant::now();
            let outcome = task::spawn_blocking(move || job.run()).await?;

            if outcome.written != outcome.expected {
                warn!(
                    "level {} of pyramid {} failed: {} of {} tiles written, {} errors",
                    level_index,
                    panorama_id,
                    outcome.written,
                    outcome.expected,
                    outcome.failed.len()
                );
                return Err(PyramidError::LevelIncomplete {
                    level: level_index,
                    written: outcome.written,
                    expected: outcome.expected,
                });
            }
            info!(
                "Finished generating tiles for level {} ({}px, {} tiles, {:.1}s)",
                level_index,
                level.size,
                outcome.written,
                level_start.elapsed().as_secs_f64()
            );
        }

        info!(
            "pyramid {} complete in {:.1}s",
            panorama_id,
            start.elapsed().as_secs_f64()
        );
        Ok(levels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pyramid::verify_pyramid;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn faces(size: u32) -> Vec<FaceImage> {
        FaceName::ALL
            .iter()
            .enumerate()
            .map(|(i, f)| {
                let img = RgbImage::from_fn(size, size, |x, y| {
                    image::Rgb([(x % 256) as u8, (y % 256) as u8, (i * 40) as u8])
                });
                let mut buf = Cursor::new(Vec::new());
                img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
                FaceImage::new(format!("{}.png", f), buf.into_inner())
            })
            .collect()
    }

    fn builder(root: &TempDir) -> PyramidBuilder {
        PyramidBuilder::new(PyramidConfig {
            storage_root: root.path().to_path_buf(),
            ..PyramidConfig::default()
        })
    }

    struct FailingEncoder;

    impl JpegEncoder for FailingEncoder {
        fn encode_rgb(&self, _: &[u8], _: u32, _: u32, _: u8) -> anyhow::Result<Vec<u8>> {
            anyhow::bail!("encoder offline")
        }
        fn name(&self) -> &str {
            "failing"
        }
    }

    struct SlowEncoder(Duration);

    impl JpegEncoder for SlowEncoder {
        fn encode_rgb(&self, p: &[u8], w: u32, h: u32, q: u8) -> anyhow::Result<Vec<u8>> {
            std::thread::sleep(self.0);
            ImageJpegEncoder.encode_rgb(p, w, h, q)
        }
        fn name(&self) -> &str {
            "slow"
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_build_writes_every_tile() {
        let tmp = TempDir::new().unwrap();
        let levels = builder(&tmp)
            .build_pyramid("pano", faces(1024), 1024)
            .await
            .unwrap();
        assert_eq!(levels, compute_levels(1024));
        let written = verify_pyramid(tmp.path(), "pano", &levels, &FaceName::ALL).unwrap();
        assert_eq!(written, (1 + 1 + 4) * 6);

        let tile = image::open(tmp.path().join("pano/2/front/tile-1-1.jpg")).unwrap();
        assert_eq!((tile.width(), tile.height()), (512, 512));
    }

    #[tokio::test]
    async fn test_rejects_small_base_size() {
        let tmp = TempDir::new().unwrap();
        let err = builder(&tmp)
            .build_pyramid("pano", faces(128), 128)
            .await
            .unwrap_err();
        assert!(matches!(err, PyramidError::InvalidInput(_)));
        assert!(!tmp.path().join("pano").exists());
    }

    #[tokio::test]
    async fn test_rejects_uneven_tiling() {
        let tmp = TempDir::new().unwrap();
        let err = builder(&tmp)
            .build_pyramid("pano", Vec::new(), 1025)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not split"));
    }

    #[tokio::test]
    async fn test_rejects_bad_panorama_id() {
        let tmp = TempDir::new().unwrap();
        let err = builder(&tmp)
            .build_pyramid("../escape", faces(256), 256)
            .await
            .unwrap_err();
        assert!(matches!(err, PyramidError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_rejects_declared_size_mismatch() {
        let tmp = TempDir::new().unwrap();
        let err = builder(&tmp)
            .build_pyramid("pano", faces(256), 512)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("declared face size"));
        // validation happens before any directory is created
        assert!(!tmp.path().join("pano").exists());
    }

    #[tokio::test]
    async fn test_tile_failure_ends_build_with_incomplete_level() {
        let tmp = TempDir::new().unwrap();
        let err = builder(&tmp)
            .with_encoder(Arc::new(FailingEncoder))
            .build_pyramid("pano", faces(512), 512)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PyramidError::LevelIncomplete { level: 0, written: 0, expected: 6 }
        ));
        // level 1 never started
        assert!(!tmp.path().join("pano/1/up/tile-0-0.jpg").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timeout_reports_stalled() {
        let tmp = TempDir::new().unwrap();
        let b = PyramidBuilder::new(PyramidConfig {
            storage_root: tmp.path().to_path_buf(),
            timeout: Duration::from_millis(50),
            ..PyramidConfig::default()
        })
        .with_encoder(Arc::new(SlowEncoder(Duration::from_millis(300))));
        let err = b.build_pyramid("pano", faces(256), 256).await.unwrap_err();
        assert!(matches!(err, PyramidError::Stalled(_)));
        assert!(err.to_string().contains("stalled"));
    }

    fn count_tiles(dir: &std::path::Path) -> usize {
        let Ok(entries) = fs::read_dir(dir) else {
            return 0;
        };
        entries
            .filter_map(|e| e.ok())
            .map(|e| {
                let path = e.path();
                if path.is_dir() {
                    count_tiles(&path)
                } else if path.extension().is_some_and(|ext| ext == "jpg") {
                    1
                } else {
                    0
                }
            })
            .sum()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timeout_stops_tile_writes() {
        let tmp = TempDir::new().unwrap();
        let b = PyramidBuilder::new(PyramidConfig {
            storage_root: tmp.path().to_path_buf(),
            timeout: Duration::from_millis(300),
            ..PyramidConfig::default()
        })
        .with_encoder(Arc::new(SlowEncoder(Duration::from_millis(200))));
        let err = b.build_pyramid("pano", faces(1024), 1024).await.unwrap_err();
        assert!(matches!(err, PyramidError::Stalled(_)));

        // tiles already being encoded get dropped instead of written
        tokio::time::sleep(Duration::from_millis(600)).await;
        let settled = count_tiles(tmp.path());
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(count_tiles(tmp.path()), settled);
        assert!(settled < 36);
    }

    #[tokio::test]
    async fn test_unwritable_root_fails_before_tiles() {
        let tmp = TempDir::new().unwrap();
        let file_root = tmp.path().join("not-a-dir");
        fs::write(&file_root, b"x").unwrap();
        let b = PyramidBuilder::new(PyramidConfig {
            storage_root: file_root,
            ..PyramidConfig::default()
        });
        let err = b.build_pyramid("pano", faces(256), 256).await.unwrap_err();
        assert!(matches!(err, PyramidError::Io { .. }));
        assert!(err.to_string().contains("not-a-dir"));
        assert_eq!(count_tiles(tmp.path()), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_spawn_completes_exactly_once() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_path_buf();
        let b = Arc::new(builder(&tmp));
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let (tx, rx) = tokio::sync::oneshot::channel();

        let handle = b.spawn("once".to_string(), faces(1024), 1024, move |result| {
            seen.fetch_add(1, Ordering::SeqCst);
            let levels = result.unwrap();
            // every tile of the finest level is already on disk
            let n = verify_pyramid(&root, "once", &levels, &FaceName::ALL).unwrap();
            let _ = tx.send(n);
        });
        handle.await.unwrap();

        assert_eq!(rx.await.unwrap(), 36);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_spawn_reports_failure_once() {
        let tmp = TempDir::new().unwrap();
        let b = Arc::new(builder(&tmp));
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        b.spawn("bad".to_string(), faces(256).split_off(1), 256, move |result| {
            seen.fetch_add(1, Ordering::SeqCst);
            assert!(result.is_err());
        })
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
