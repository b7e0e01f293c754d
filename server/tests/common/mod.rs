#![allow(dead_code)]

use std::io::Cursor;

use image::{Rgb, RgbImage};
use panotile::{FaceImage, FaceName};

/// A face with smooth gradients and a per-face tint, so tiles differ from
/// each other and from their neighbours.
pub fn gradient_face(face_index: usize, size: u32) -> RgbImage {
    RgbImage::from_fn(size, size, |x, y| {
        Rgb([
            ((x * 255) / size.max(1)) as u8,
            ((y * 255) / size.max(1)) as u8,
            (40 + face_index * 30) as u8,
        ])
    })
}

pub fn encode_png(img: &RgbImage) -> Vec<u8> {
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, image::ImageFormat::Png)
        .expect("png encode");
    buf.into_inner()
}

/// Six PNG faces named `<face>.png`.
pub fn png_faces(size: u32) -> Vec<FaceImage> {
    FaceName::ALL
        .iter()
        .enumerate()
        .map(|(i, f)| FaceImage::new(format!("{}.png", f), encode_png(&gradient_face(i, size))))
        .collect()
}
