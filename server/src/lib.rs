pub mod builder;
pub mod core;
pub mod error;
pub mod ingest;
pub mod serve;
pub mod store;

// Re-exports for easy access
pub use builder::{PyramidBuilder, PyramidConfig};
pub use crate::core::face::{FaceImage, FaceName};
pub use crate::core::levels::{compute_levels, ResolutionLevel};
pub use error::{PyramidError, Result};
