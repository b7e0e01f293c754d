use std::fs;
use std::path::{Path, PathBuf};

use image::RgbImage;

use crate::core::face::FaceName;
use crate::core::levels::ResolutionLevel;
use crate::error::{PyramidError, Result};

/// Pyramid metadata discovered from a panorama directory.
pub struct PyramidInfo {
    pub panorama_dir: PathBuf,
    pub level_count: usize,
    pub faces: Vec<FaceName>,
}

/// Reject panorama ids that would not stay a single path segment.
pub fn validate_panorama_id(id: &str) -> Result<()> {
    let ok = !id.is_empty()
        && id.len() <= 128
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(PyramidError::InvalidInput(format!(
            "panorama id '{}' must be 1-128 characters of [A-Za-z0-9_-]",
            id
        )))
    }
}

/// `<root>/<panorama_id>`
pub fn panorama_dir(root: &Path, panorama_id: &str) -> PathBuf {
    root.join(panorama_id)
}

/// `<root>/<panorama_id>/<level>/<face>`
pub fn face_dir(root: &Path, panorama_id: &str, level: usize, face: FaceName) -> PathBuf {
    panorama_dir(root, panorama_id)
        .join(level.to_string())
        .join(face.as_str())
}

/// File name of tile `(x, y)`: `tile-<x>-<y>.jpg`.
pub fn tile_file_name(x: u32, y: u32) -> String {
    format!("tile-{}-{}.jpg", x, y)
}

pub fn tile_path(
    root: &Path,
    panorama_id: &str,
    level: usize,
    face: FaceName,
    x: u32,
    y: u32,
) -> PathBuf {
    face_dir(root, panorama_id, level, face).join(tile_file_name(x, y))
}

/// Parse tile coordinates from a filename like "tile-3-2.jpg" → Some((3, 2)).
pub fn parse_tile_name(name: &str) -> Option<(u32, u32)> {
    let trimmed = name.strip_prefix("tile-")?.strip_suffix(".jpg")?;
    let mut parts = trimmed.split('-');
    let x = parts.next()?.parse().ok()?;
    let y = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((x, y))
}

/// Create every `(level, face)` directory of a pyramid, one after another.
///
/// All directories exist before the first tile is written, so concurrent tile
/// writers never race on creating a shared parent.
pub fn prepare_directories(
    root: &Path,
    panorama_id: &str,
    level_count: usize,
    faces: &[FaceName],
) -> Result<Vec<PathBuf>> {
    let mut created = Vec::with_capacity(level_count * faces.len());
    for &face in faces {
        for level in 0..level_count {
            let dir = face_dir(root, panorama_id, level, face);
            fs::create_dir_all(&dir).map_err(|e| PyramidError::io(&dir, e))?;
            created.push(dir);
        }
    }
    Ok(created)
}

/// Copy the `tile_size` square at grid position `(x, y)` out of a face.
pub fn extract_tile(face: &RgbImage, x: u32, y: u32, tile_size: u32) -> RgbImage {
    image::imageops::crop_imm(face, x * tile_size, y * tile_size, tile_size, tile_size).to_image()
}

/// Discover an existing pyramid on disk.
///
/// Level directories are the numeric children of the panorama directory; faces
/// are read from level 0.
pub fn discover_pyramid(root: &Path, panorama_id: &str) -> Result<PyramidInfo> {
    let dir = panorama_dir(root, panorama_id);
    if !dir.is_dir() {
        return Err(PyramidError::InvalidInput(format!(
            "no pyramid at {}",
            dir.display()
        )));
    }

    let mut levels: Vec<usize> = Vec::new();
    for entry in fs::read_dir(&dir).map_err(|e| PyramidError::io(&dir, e))? {
        let entry = entry.map_err(|e| PyramidError::io(&dir, e))?;
        if !entry.path().is_dir() {
            continue;
        }
        if let Ok(level) = entry.file_name().to_string_lossy().parse::<usize>() {
            levels.push(level);
        }
    }
    levels.sort_unstable();
    if levels.is_empty() || levels.iter().enumerate().any(|(i, &l)| i != l) {
        return Err(PyramidError::InvalidInput(format!(
            "level directories under {} are not contiguous from 0",
            dir.display()
        )));
    }

    let level0 = dir.join("0");
    let mut faces: Vec<FaceName> = FaceName::ALL
        .iter()
        .copied()
        .filter(|f| level0.join(f.as_str()).is_dir())
        .collect();
    faces.sort();

    Ok(PyramidInfo {
        panorama_dir: dir,
        level_count: levels.len(),
        faces,
    })
}

/// List the tile files of one face directory, sorted by `(x, y)`.
pub fn list_tiles(dir: &Path) -> Result<Vec<(u32, u32)>> {
    let mut tiles = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| PyramidError::io(dir, e))? {
        let entry = entry.map_err(|e| PyramidError::io(dir, e))?;
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(coords) = parse_tile_name(&name) {
            tiles.push(coords);
        }
    }
    tiles.sort_unstable();
    Ok(tiles)
}

/// Check a built pyramid against its level list: every face at every level
/// holds exactly the expected tile grid.
pub fn verify_pyramid(
    root: &Path,
    panorama_id: &str,
    levels: &[ResolutionLevel],
    faces: &[FaceName],
) -> Result<usize> {
    let mut total = 0;
    for (level_idx, level) in levels.iter().enumerate() {
        let n = level.tiles_per_axis();
        let expected: Vec<(u32, u32)> = (0..n)
            .flat_map(|x| (0..n).map(move |y| (x, y)))
            .collect();
        for &face in faces {
            let found = list_tiles(&face_dir(root, panorama_id, level_idx, face))?;
            if found != expected {
                return Err(PyramidError::LevelIncomplete {
                    level: level_idx,
                    written: found.len(),
                    expected: expected.len(),
                });
            }
            total += found.len();
        }
    }
    Ok(total)
}
