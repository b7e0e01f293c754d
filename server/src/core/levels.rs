use serde::{Deserialize, Serialize};

/// Smallest face edge that still gets its own pyramid level.
pub const MIN_LEVEL_SIZE: u32 = 256;

/// One zoom level of a cubemap pyramid.
///
/// Serialises as `{ "size": .., "tileSize": .. }`, which is the shape the
/// viewer's cube geometry consumes verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionLevel {
    pub size: u32,
    pub tile_size: u32,
}

impl ResolutionLevel {
    /// Tiles along one edge of a face at this level.
    pub fn tiles_per_axis(&self) -> u32 {
        if self.tile_size == 0 {
            return 0;
        }
        self.size / self.tile_size
    }

    /// Tiles covering one face at this level.
    pub fn tiles_per_face(&self) -> usize {
        let n = self.tiles_per_axis() as usize;
        n * n
    }

    /// True when the face splits into whole tiles with nothing left over.
    pub fn is_evenly_tiled(&self) -> bool {
        self.tile_size > 0 && self.size % self.tile_size == 0
    }
}

/// Halve `base_size` down to the smallest value still >= [`MIN_LEVEL_SIZE`],
/// largest first.
fn level_sizes(base_size: u32) -> Vec<u32> {
    let mut sizes = Vec::new();
    let mut size = base_size;
    while size >= MIN_LEVEL_SIZE {
        sizes.push(size);
        size /= 2;
    }
    sizes
}

/// Compute the pyramid levels for a face of edge `base_size`, coarsest first.
///
/// The coarsest level is a single tile. Every finer level is cut into tiles
/// whose edge equals the second-coarsest level size, however large the level
/// is. Faces smaller than 256px produce no levels at all.
pub fn compute_levels(base_size: u32) -> Vec<ResolutionLevel> {
    let mut sizes = level_sizes(base_size);
    sizes.reverse();

    sizes
        .iter()
        .enumerate()
        .map(|(i, &size)| ResolutionLevel {
            size,
            tile_size: if i == 0 { sizes[0] } else { sizes[1] },
        })
        .collect()
}

/// Total tiles across all six faces and all levels.
pub fn total_tiles(levels: &[ResolutionLevel], faces: usize) -> usize {
    levels.iter().map(|l| l.tiles_per_face() * faces).sum()
}
