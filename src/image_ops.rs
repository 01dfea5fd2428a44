use image::{imageops, RgbImage};
use std::fmt;
use thiserror::Error;

use crate::error::SettingsError;

/// How the two lenses are packed into one combined frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LensLayout {
    SideBySide,
    TopBottom,
}

impl LensLayout {
    pub fn detect(width: u32, height: u32) -> Self {
        if width > height {
            LensLayout::SideBySide
        } else {
            LensLayout::TopBottom
        }
    }
}

/// Splits a combined frame into its two hemispheres.
///
/// Wide frames are cut down the middle column, others across the middle row.
/// The first half is `floor(n / 2)` wide (or tall); on odd sizes the second
/// half gets the extra line.
pub fn split(frame: &RgbImage) -> (RgbImage, RgbImage) {
    let (w, h) = frame.dimensions();
    match LensLayout::detect(w, h) {
        LensLayout::SideBySide => {
            let mid = w / 2;
            (
                imageops::crop_imm(frame, 0, 0, mid, h).to_image(),
                imageops::crop_imm(frame, mid, 0, w - mid, h).to_image(),
            )
        }
        LensLayout::TopBottom => {
            let mid = h / 2;
            (
                imageops::crop_imm(frame, 0, 0, w, mid).to_image(),
                imageops::crop_imm(frame, 0, mid, w, h - mid).to_image(),
            )
        }
    }
}

/// Clockwise right-angle rotation applied to the assembled panorama.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rotation {
    #[default]
    None,
    Cw90,
    Cw180,
    Cw270,
}

impl Rotation {
    pub fn from_degrees(degrees: u32) -> Result<Self, SettingsError> {
        match degrees {
            0 => Ok(Rotation::None),
            90 => Ok(Rotation::Cw90),
            180 => Ok(Rotation::Cw180),
            270 => Ok(Rotation::Cw270),
            other => Err(SettingsError::Rotation(other)),
        }
    }

    pub fn degrees(self) -> u32 {
        match self {
            Rotation::None => 0,
            Rotation::Cw90 => 90,
            Rotation::Cw180 => 180,
            Rotation::Cw270 => 270,
        }
    }

    pub fn swaps_axes(self) -> bool {
        matches!(self, Rotation::Cw90 | Rotation::Cw270)
    }

    /// Dimensions of a `width x height` image after this rotation.
    pub fn output_dimensions(self, width: u32, height: u32) -> (u32, u32) {
        if self.swaps_axes() {
            (height, width)
        } else {
            (width, height)
        }
    }

    pub fn apply(self, image: RgbImage) -> RgbImage {
        match self {
            Rotation::None => image,
            Rotation::Cw90 => imageops::rotate90(&image),
            Rotation::Cw180 => imageops::rotate180(&image),
            Rotation::Cw270 => imageops::rotate270(&image),
        }
    }
}

impl fmt::Display for Rotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}°", self.degrees())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("hemisphere heights differ ({left} vs {right})")]
pub struct HeightMismatch {
    pub left: u32,
    pub right: u32,
}

/// Places the two corrected hemispheres side by side and rotates the result.
pub fn assemble(
    left: &RgbImage,
    right: &RgbImage,
    rotation: Rotation,
) -> Result<RgbImage, HeightMismatch> {
    if left.height() != right.height() {
        return Err(HeightMismatch {
            left: left.height(),
            right: right.height(),
        });
    }
    let mut pano = RgbImage::new(left.width() + right.width(), left.height());
    imageops::replace(&mut pano, left, 0, 0);
    imageops::replace(&mut pano, right, i64::from(left.width()), 0);
    Ok(rotation.apply(pano))
}

#[cfg(test)]
pub(crate) fn gradient_frame(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([
            (x * 7 % 256) as u8,
            (y * 13 % 256) as u8,
            ((x + y) * 3 % 256) as u8,
        ])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wide_frame_splits_into_left_and_right() {
        let frame = gradient_frame(8, 4);
        let (left, right) = split(&frame);
        assert_eq!(left.dimensions(), (4, 4));
        assert_eq!(right.dimensions(), (4, 4));
        assert_eq!(left.get_pixel(3, 2), frame.get_pixel(3, 2));
        assert_eq!(right.get_pixel(0, 2), frame.get_pixel(4, 2));
    }

    #[test]
    fn square_and_tall_frames_split_into_top_and_bottom() {
        let frame = gradient_frame(6, 6);
        let (top, bottom) = split(&frame);
        assert_eq!(top.dimensions(), (6, 3));
        assert_eq!(bottom.dimensions(), (6, 3));
        assert_eq!(bottom.get_pixel(1, 0), frame.get_pixel(1, 3));
    }

    #[test]
    fn odd_dimension_grows_second_half() {
        let (left, right) = split(&gradient_frame(9, 4));
        assert_eq!(left.width(), 4);
        assert_eq!(right.width(), 5);

        let (top, bottom) = split(&gradient_frame(3, 7));
        assert_eq!(top.height(), 3);
        assert_eq!(bottom.height(), 4);
    }

    #[test]
    fn degenerate_frame_yields_empty_half() {
        let (a, b) = split(&gradient_frame(1, 1));
        assert_eq!(a.dimensions(), (1, 0));
        assert_eq!(b.dimensions(), (1, 1));
    }

    #[test]
    fn split_then_assemble_restores_wide_frame() {
        let frame = gradient_frame(16, 6);
        let (left, right) = split(&frame);
        let pano = assemble(&left, &right, Rotation::None).expect("same height");
        assert_eq!(pano, frame);
    }

    #[test]
    fn four_quarter_turns_restore_panorama() {
        let pano = gradient_frame(10, 4);
        let mut current = pano.clone();
        for turn in 1..=4 {
            current = Rotation::Cw90.apply(current);
            let expected = if turn % 2 == 1 { (4, 10) } else { (10, 4) };
            assert_eq!(current.dimensions(), expected);
        }
        assert_eq!(current, pano);
    }

    #[test]
    fn rotation_direction_matches_clockwise_convention() {
        let pano = gradient_frame(4, 2);
        let cw = Rotation::Cw90.apply(pano.clone());
        // top-left of the source ends up top-right after a clockwise turn
        assert_eq!(cw.get_pixel(1, 0), pano.get_pixel(0, 0));
        let half = Rotation::Cw180.apply(pano.clone());
        assert_eq!(half.get_pixel(3, 1), pano.get_pixel(0, 0));
        let ccw = Rotation::Cw270.apply(pano.clone());
        assert_eq!(ccw.get_pixel(0, 3), pano.get_pixel(0, 0));
    }

    #[test]
    fn assemble_rejects_mismatched_heights() {
        let err = assemble(&gradient_frame(4, 4), &gradient_frame(4, 3), Rotation::None)
            .unwrap_err();
        assert_eq!(err, HeightMismatch { left: 4, right: 3 });
    }

    #[test]
    fn rotation_parsing_and_dimensions() {
        assert_eq!(Rotation::from_degrees(270), Ok(Rotation::Cw270));
        assert_eq!(Rotation::from_degrees(45), Err(SettingsError::Rotation(45)));
        assert_eq!(Rotation::Cw90.output_dimensions(3840, 1920), (1920, 3840));
        assert_eq!(Rotation::Cw180.output_dimensions(3840, 1920), (3840, 1920));
    }
}
