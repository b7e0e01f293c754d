use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use image::RgbImage;
use rayon::prelude::*;

use crate::error::{PyramidError, Result};

/// The six faces of a cube map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FaceName {
    Up,
    Down,
    Front,
    Back,
    Left,
    Right,
}

impl FaceName {
    pub const ALL: [FaceName; 6] = [
        FaceName::Up,
        FaceName::Down,
        FaceName::Front,
        FaceName::Back,
        FaceName::Left,
        FaceName::Right,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FaceName::Up => "up",
            FaceName::Down => "down",
            FaceName::Front => "front",
            FaceName::Back => "back",
            FaceName::Left => "left",
            FaceName::Right => "right",
        }
    }

    /// Resolve an uploaded file name to the face it names.
    ///
    /// Any directory part and extension are dropped and the stem is matched
    /// case-insensitively, so `"../Up.JPG"` resolves to `up`. The returned
    /// face is what ends up in tile paths; the raw file name never does.
    pub fn from_file_name(file_name: &str) -> Result<FaceName> {
        let base = file_name
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(file_name);
        let stem = match base.rsplit_once('.') {
            Some((stem, _ext)) if !stem.is_empty() => stem,
            _ => base,
        };
        stem.parse().map_err(PyramidError::InvalidInput)
    }
}

impl fmt::Display for FaceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FaceName {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "up" => Ok(FaceName::Up),
            "down" => Ok(FaceName::Down),
            "front" => Ok(FaceName::Front),
            "back" => Ok(FaceName::Back),
            "left" => Ok(FaceName::Left),
            "right" => Ok(FaceName::Right),
            _ => Err(format!(
                "unknown cube face '{}'. Available: up, down, front, back, left, right",
                s
            )),
        }
    }
}

/// One encoded cube face as it arrives from an upload or from disk.
#[derive(Debug, Clone)]
pub struct FaceImage {
    pub file_name: String,
    pub bytes: Bytes,
}

impl FaceImage {
    pub fn new(file_name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            file_name: file_name.into(),
            bytes: bytes.into(),
        }
    }
}

/// A face decoded to RGB and checked against the declared base size.
#[derive(Debug)]
pub struct DecodedFace {
    pub face: FaceName,
    pub pixels: RgbImage,
}

/// Check the shape of a face set without decoding any pixels.
///
/// Requires exactly six faces, each resolving to a distinct face name.
pub fn resolve_face_names(faces: &[FaceImage]) -> Result<Vec<FaceName>> {
    if faces.len() != FaceName::ALL.len() {
        return Err(PyramidError::InvalidInput(format!(
            "expected {} cube faces, got {}",
            FaceName::ALL.len(),
            faces.len()
        )));
    }
    let mut names = Vec::with_capacity(faces.len());
    for face in faces {
        let name = FaceName::from_file_name(&face.file_name)?;
        if names.contains(&name) {
            return Err(PyramidError::InvalidInput(format!(
                "face '{}' supplied more than once (file '{}')",
                name, face.file_name
            )));
        }
        names.push(name);
    }
    Ok(names)
}

/// Decode all six faces in parallel and verify each is `base_size` square.
pub fn decode_faces(faces: &[FaceImage], base_size: u32) -> Result<Vec<DecodedFace>> {
    let names = resolve_face_names(faces)?;

    faces
        .par_iter()
        .zip(names.par_iter())
        .map(|(face, &name)| {
            let pixels = image::load_from_memory(&face.bytes)
                .map_err(|e| {
                    PyramidError::InvalidInput(format!(
                        "face '{}' ({}) could not be decoded: {}",
                        name, face.file_name, e
                    ))
                })?
                .to_rgb8();
            let (w, h) = pixels.dimensions();
            if w != h {
                return Err(PyramidError::InvalidInput(format!(
                    "face '{}' is {}x{}, cube faces must be square",
                    name, w, h
                )));
            }
            if w != base_size {
                return Err(PyramidError::InvalidInput(format!(
                    "face '{}' is {}x{} but the declared face size is {}",
                    name, w, h, base_size
                )));
            }
            Ok(DecodedFace { face: name, pixels })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn png_face(name: &str, w: u32, h: u32) -> FaceImage {
        let img = RgbImage::from_pixel(w, h, image::Rgb([10, 20, 30]));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, image::ImageFormat::Png).unwrap();
        FaceImage::new(name, buf.into_inner())
    }

    fn six(w: u32) -> Vec<FaceImage> {
        FaceName::ALL
            .iter()
            .map(|f| png_face(f.as_str(), w, w))
            .collect()
    }

    #[test]
    fn test_face_name_from_file_name() {
        assert_eq!(FaceName::from_file_name("up").unwrap(), FaceName::Up);
        assert_eq!(FaceName::from_file_name("Front.jpg").unwrap(), FaceName::Front);
        assert_eq!(FaceName::from_file_name("../../left.png").unwrap(), FaceName::Left);
        assert_eq!(FaceName::from_file_name("C:\\tmp\\RIGHT.JPEG").unwrap(), FaceName::Right);
    }

    #[test]
    fn test_face_name_rejects_unknown() {
        assert!(FaceName::from_file_name("").is_err());
        assert!(FaceName::from_file_name("..").is_err());
        assert!(FaceName::from_file_name("top.jpg").is_err());
        assert!(FaceName::from_file_name("up/").is_err());
    }

    #[test]
    fn test_display_roundtrip() {
        for face in FaceName::ALL {
            assert_eq!(face.to_string().parse::<FaceName>().unwrap(), face);
        }
    }

    #[test]
    fn test_resolve_requires_six() {
        let mut faces = six(8);
        faces.pop();
        let err = resolve_face_names(&faces).unwrap_err();
        assert!(matches!(err, PyramidError::InvalidInput(_)));
    }

    #[test]
    fn test_resolve_rejects_duplicates() {
        let mut faces = six(8);
        faces[5] = png_face("up.png", 8, 8);
        let err = resolve_face_names(&faces).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_decode_faces_ok() {
        let decoded = decode_faces(&six(16), 16).unwrap();
        assert_eq!(decoded.len(), 6);
        assert_eq!(decoded[2].face, FaceName::Front);
        assert_eq!(decoded[2].pixels.dimensions(), (16, 16));
    }

    #[test]
    fn test_decode_faces_size_mismatch() {
        let err = decode_faces(&six(16), 32).unwrap_err();
        assert!(err.to_string().contains("declared face size"));
    }

    #[test]
    fn test_decode_faces_not_square() {
        let mut faces = six(16);
        faces[0] = png_face("up", 16, 8);
        let err = decode_faces(&faces, 16).unwrap_err();
        assert!(err.to_string().contains("square"));
    }

    #[test]
    fn test_decode_faces_garbage() {
        let mut faces = six(16);
        faces[3] = FaceImage::new("back.jpg", vec![0u8, 1, 2, 3]);
        let err = decode_faces(&faces, 16).unwrap_err();
        assert!(err.to_string().contains("could not be decoded"));
    }
}
