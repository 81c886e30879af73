//! ImageNet preprocessing: resize the shorter side, center-crop, scale to `[0, 1]`, normalize.
//!
//! The constants must match what the pretrained weights were trained with. Nothing checks
//! this: a mismatch only shows up as meaningless scores.

use std::path::Path;

use anyhow::{Context, ensure};
use image::{
    DynamicImage, ImageReader, RgbImage,
    imageops::{self, FilterType},
};
use tract_onnx::prelude::*;

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];
pub const RESIZE_SHORTER_SIDE: u32 = 256;
pub const CROP_SIZE: u32 = 224;
/// `[batch, channels, height, width]` of every tensor produced by [`Preprocess::imagenet`].
pub const IMAGENET_INPUT_SHAPE: [usize; 4] = [1, 3, CROP_SIZE as usize, CROP_SIZE as usize];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Preprocess {
    pub resize: u32,
    pub crop_width: u32,
    pub crop_height: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Default for Preprocess {
    fn default() -> Self {
        Self::imagenet()
    }
}

impl Preprocess {
    pub fn imagenet() -> Self {
        Self {
            resize: RESIZE_SHORTER_SIDE,
            crop_width: CROP_SIZE,
            crop_height: CROP_SIZE,
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
        }
    }

    /// Runs the fixed sequence of transforms and adds the leading batch dimension.
    ///
    /// Grayscale and alpha images are converted to RGB first, alpha is dropped. Images with
    /// no pixels are rejected.
    pub fn apply(&self, image: &DynamicImage) -> anyhow::Result<Tensor> {
        ensure!(
            image.width() > 0 && image.height() > 0,
            "cannot preprocess an empty {}x{} image",
            image.width(),
            image.height()
        );
        let rgb = image.to_rgb8();
        let resized = resize_shorter_side(&rgb, self.resize);
        let cropped = center_crop(&resized, self.crop_width, self.crop_height);
        let mut tensor = to_tensor(&cropped);
        normalize(&mut tensor, self.mean, self.std);
        Ok(tensor.into())
    }

    pub fn apply_path<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<Tensor> {
        self.apply(&load_image(path)?)
    }
}

/// Decodes the image at `path`, the format is sniffed from the content.
pub fn load_image<P: AsRef<Path>>(path: P) -> anyhow::Result<DynamicImage> {
    let path = path.as_ref();
    let image = ImageReader::open(path)
        .with_context(|| format!("opening image {}", path.display()))?
        .with_guessed_format()?
        .decode()
        .with_context(|| format!("decoding image {}", path.display()))?;
    Ok(image)
}

/// Dimensions after scaling the shorter side to `target`; the longer side is truncated.
/// A zero side is treated as one pixel.
pub fn resized_dimensions(width: u32, height: u32, target: u32) -> (u32, u32) {
    let (width, height) = (width.max(1), height.max(1));
    let scale = |long: u32, short: u32| (target as u64 * long as u64 / short as u64) as u32;
    if width <= height {
        (target, scale(height, width))
    } else {
        (scale(width, height), target)
    }
}

/// Bilinear resize keeping the aspect ratio. Images already at the target size are copied as is.
pub fn resize_shorter_side(image: &RgbImage, target: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    let (new_width, new_height) = resized_dimensions(width, height, target);
    if (new_width, new_height) == (width, height) {
        return image.clone();
    }
    imageops::resize(image, new_width, new_height, FilterType::Triangle)
}

/// Crops the centered `width`x`height` window; smaller images are zero padded around first.
///
/// Offsets are rounded half to even, so an odd margin puts the extra pixel on an even side.
pub fn center_crop(image: &RgbImage, width: u32, height: u32) -> RgbImage {
    let (img_width, img_height) = image.dimensions();
    if img_width < width || img_height < height {
        let canvas_width = img_width.max(width);
        let canvas_height = img_height.max(height);
        let mut canvas = RgbImage::new(canvas_width, canvas_height);
        let left = (canvas_width - img_width) / 2;
        let top = (canvas_height - img_height) / 2;
        imageops::overlay(&mut canvas, image, left as i64, top as i64);
        return center_crop(&canvas, width, height);
    }
    let offset = |full: u32, crop: u32| ((full - crop) as f64 / 2.0).round_ties_even() as u32;
    let left = offset(img_width, width);
    let top = offset(img_height, height);
    imageops::crop_imm(image, left, top, width, height).to_image()
}

/// `[1, 3, h, w]` array of channel values scaled to `[0, 1]`.
pub fn to_tensor(image: &RgbImage) -> tract_ndarray::Array4<f32> {
    let (width, height) = image.dimensions();
    tract_ndarray::Array4::from_shape_fn(
        (1, 3, height as usize, width as usize),
        |(_, c, y, x)| image.get_pixel(x as u32, y as u32)[c] as f32 / 255.0,
    )
}

/// In place `(value - mean[c]) / std[c]` over the channel axis.
pub fn normalize(tensor: &mut tract_ndarray::Array4<f32>, mean: [f32; 3], std: [f32; 3]) {
    for (c, mut plane) in tensor.axis_iter_mut(tract_ndarray::Axis(1)).enumerate() {
        plane.mapv_inplace(|v| (v - mean[c]) / std[c]);
    }
}

#[cfg(test)]
mod test {
    use image::Rgb;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case((500, 375), (341, 256))]
    #[case((375, 500), (256, 341))]
    #[case((256, 256), (256, 256))]
    #[case((224, 224), (256, 256))]
    #[case((1, 1), (256, 256))]
    #[case((1000, 10), (25600, 256))]
    fn test_resized_dimensions(#[case] input: (u32, u32), #[case] expected: (u32, u32)) {
        assert_eq!(resized_dimensions(input.0, input.1, 256), expected);
    }

    #[rstest]
    #[case(640, 480)]
    #[case(480, 640)]
    #[case(256, 256)]
    #[case(224, 224)]
    #[case(100, 37)]
    #[case(1, 1)]
    #[case(17, 900)]
    fn test_output_shape_is_fixed(#[case] width: u32, #[case] height: u32) -> anyhow::Result<()> {
        let image = DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, 128])
        }));
        let tensor = Preprocess::imagenet().apply(&image)?;
        assert_eq!(tensor.shape(), &IMAGENET_INPUT_SHAPE);
        assert_eq!(tensor.datum_type(), f32::datum_type());
        Ok(())
    }

    #[rstest]
    #[case(0, 5)]
    #[case(5, 0)]
    #[case(0, 0)]
    fn test_empty_image_is_rejected(#[case] width: u32, #[case] height: u32) {
        let image = DynamicImage::ImageRgb8(RgbImage::new(width, height));
        assert!(Preprocess::imagenet().apply(&image).is_err());
        let (new_width, new_height) = resized_dimensions(width, height, 256);
        assert_eq!(new_width.min(new_height), 256);
    }

    #[test]
    fn test_uniform_image_normalizes_exactly() -> anyhow::Result<()> {
        let color = [200u8, 13, 97];
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(256, 256, Rgb(color)));
        let tensor = Preprocess::imagenet().apply(&image)?;
        let view = tensor.to_array_view::<f32>()?;
        for c in 0..3 {
            let expected = (color[c] as f32 / 255.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
            assert!(
                view.index_axis(tract_ndarray::Axis(1), c)
                    .iter()
                    .all(|v| *v == expected),
                "channel {c} differs from {expected}"
            );
        }
        Ok(())
    }

    #[test]
    fn test_grayscale_and_alpha_are_converted_to_rgb() -> anyhow::Result<()> {
        let gray = DynamicImage::ImageLuma8(image::GrayImage::from_pixel(300, 260, image::Luma([90])));
        let rgba = DynamicImage::ImageRgba8(image::RgbaImage::from_pixel(
            300,
            260,
            image::Rgba([90, 90, 90, 0]),
        ));
        let preprocess = Preprocess::imagenet();
        assert_eq!(preprocess.apply(&gray)?, preprocess.apply(&rgba)?);
        Ok(())
    }

    #[rstest]
    // margins 7 and 2: 3.5 rounds to 4, 1.0 stays 1
    #[case(231, 226, (4, 1))]
    // margin 5: 2.5 rounds to 2
    #[case(229, 224, (2, 0))]
    #[case(224, 224, (0, 0))]
    fn test_center_crop_offsets(
        #[case] width: u32,
        #[case] height: u32,
        #[case] expected: (u8, u8),
    ) {
        let image = RgbImage::from_fn(width, height, |x, y| Rgb([x as u8, y as u8, 0]));
        let cropped = center_crop(&image, 224, 224);
        assert_eq!(cropped.dimensions(), (224, 224));
        assert_eq!(cropped.get_pixel(0, 0), &Rgb([expected.0, expected.1, 0]));
    }

    #[test]
    fn test_center_crop_pads_small_images() {
        let image = RgbImage::from_pixel(200, 220, Rgb([255, 255, 255]));
        let cropped = center_crop(&image, 224, 224);
        assert_eq!(cropped.dimensions(), (224, 224));
        assert_eq!(cropped.get_pixel(0, 0), &Rgb([0, 0, 0]));
        assert_eq!(cropped.get_pixel(12, 2), &Rgb([255, 255, 255]));
        assert_eq!(cropped.get_pixel(211, 221), &Rgb([255, 255, 255]));
        assert_eq!(cropped.get_pixel(212, 222), &Rgb([0, 0, 0]));
    }

    #[test]
    fn test_resize_keeps_same_size_untouched() {
        let image = RgbImage::from_fn(256, 300, |x, y| Rgb([x as u8, y as u8, 7]));
        assert_eq!(resize_shorter_side(&image, 256), image);
    }

    #[test]
    fn test_undecodable_image_fails() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("broken.jpg");
        std::fs::write(&path, b"definitely not a jpeg")?;
        assert!(load_image(&path).is_err());
        assert!(load_image(dir.path().join("missing.jpg")).is_err());
        Ok(())
    }
}
