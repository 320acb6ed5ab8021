//! Image loading, tensor conversion and raster helpers.

use anyhow::{ensure, Context, Result};
use burn::prelude::*;
use burn::tensor::TensorData;
use image::{DynamicImage, GrayImage, RgbImage};
use ndarray::Array3;
use std::fs;
use std::path::{Path, PathBuf};

/// Load an image as a `[1, C, H, W]` tensor in `[0, 1]`.
///
/// Color images give `C = 3` (RGB), grayscale images `C = 1`.
pub fn load_image_tensor<B: Backend>(path: &Path, device: &B::Device) -> Result<Tensor<B, 4>> {
    let img = image::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    let (w, h) = (img.width() as usize, img.height() as usize);

    let (channels, raw) = if img.color().has_color() {
        (3, img.to_rgb8().into_raw())
    } else {
        (1, img.to_luma8().into_raw())
    };

    // Interleaved HWC bytes -> planar CHW floats
    let mut data = vec![0.0f32; channels * h * w];
    for (i, &v) in raw.iter().enumerate() {
        let c = i % channels;
        let p = i / channels;
        data[c * h * w + p] = v as f32 / 255.0;
    }

    Ok(Tensor::from_data(
        TensorData::new(data, [1, channels, h, w]),
        device,
    ))
}

/// Crop the bottom/right edges so both spatial sides are multiples of `scale`.
pub fn modcrop<B: Backend>(tensor: Tensor<B, 4>, scale: usize) -> Result<Tensor<B, 4>> {
    let [n, c, h, w] = tensor.dims();
    let (new_h, new_w) = (h - h % scale, w - w % scale);
    ensure!(
        new_h > 0 && new_w > 0,
        "image of {w}x{h} is smaller than the scale factor {scale}"
    );
    if (new_h, new_w) == (h, w) {
        return Ok(tensor);
    }
    Ok(tensor.slice([0..n, 0..c, 0..new_h, 0..new_w]))
}

/// Convert the first image of a `[N, C, H, W]` tensor in `[0, 1]` to an 8-bit raster.
pub fn tensor_to_image<B: Backend>(tensor: &Tensor<B, 4>) -> Result<DynamicImage> {
    let [_, c, h, w] = tensor.dims();
    ensure!(
        c == 1 || c == 3,
        "cannot convert a {c}-channel tensor to an image"
    );

    let data: Vec<f32> = tensor
        .clone()
        .slice([0..1, 0..c, 0..h, 0..w])
        .clamp(0.0, 1.0)
        .reshape([c * h * w])
        .into_data()
        .to_vec()
        .map_err(|e| anyhow::anyhow!("tensor conversion failed: {e:?}"))?;

    let hw = h * w;
    let mut raw = vec![0u8; c * hw];
    for p in 0..hw {
        for ch in 0..c {
            raw[p * c + ch] = (data[ch * hw + p] * 255.0).round() as u8;
        }
    }

    let img = if c == 3 {
        RgbImage::from_raw(w as u32, h as u32, raw).map(DynamicImage::ImageRgb8)
    } else {
        GrayImage::from_raw(w as u32, h as u32, raw).map(DynamicImage::ImageLuma8)
    };
    img.ok_or_else(|| anyhow::anyhow!("raster buffer does not match {w}x{h}x{c}"))
}

/// Raster as an `(H, W, C)` array of values in `0..=255`.
pub fn image_to_array(img: &DynamicImage) -> Array3<f64> {
    let (w, h) = (img.width() as usize, img.height() as usize);
    if img.color().has_color() {
        let rgb = img.to_rgb8();
        Array3::from_shape_fn((h, w, 3), |(y, x, c)| rgb.get_pixel(x as u32, y as u32)[c] as f64)
    } else {
        let gray = img.to_luma8();
        Array3::from_shape_fn((h, w, 1), |(y, x, _)| gray.get_pixel(x as u32, y as u32)[0] as f64)
    }
}

/// ITU-R BT.601 luma of an RGB array in `0..=255`, as `(H, W, 1)` in the same range.
pub fn rgb_to_y(img: &Array3<f64>) -> Result<Array3<f64>> {
    let (h, w, c) = img.dim();
    ensure!(c == 3, "luma conversion needs 3 channels, got {c}");
    Ok(Array3::from_shape_fn((h, w, 1), |(y, x, _)| {
        (65.481 * img[[y, x, 0]] + 128.553 * img[[y, x, 1]] + 24.966 * img[[y, x, 2]]) / 255.0
            + 16.0
    }))
}

/// `<dir>/<name><suffix>.png`
pub fn output_image_path(dir: &Path, name: &str, suffix: &str) -> PathBuf {
    dir.join(format!("{name}{suffix}.png"))
}

/// File stem used as the sample identity.
pub fn sample_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

pub fn save_image(img: &DynamicImage, path: &Path) -> Result<()> {
    img.save(path)
        .with_context(|| format!("failed to save image to {}", path.display()))
}

/// Recognized image file extensions.
pub fn is_image_extension(path: &Path) -> bool {
    matches!(
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .as_deref(),
        Some("jpg" | "jpeg" | "png" | "ppm" | "bmp" | "tif" | "tiff" | "webp")
    )
}

/// All image files under `dir` (recursively), sorted by path.
pub fn collect_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut images = Vec::new();
    collect_images_recursive(dir, &mut images)?;
    images.sort();
    Ok(images)
}

fn collect_images_recursive(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir)
        .with_context(|| format!("cannot read directory {}", dir.display()))?
    {
        let path = entry?.path();
        if path.is_dir() {
            collect_images_recursive(&path, out)?;
        } else if is_image_extension(&path) {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray;

    #[test]
    fn output_path_appends_optional_suffix() {
        let dir = Path::new("results/Set5");
        assert_eq!(
            output_image_path(dir, "img001", "_x4"),
            dir.join("img001_x4.png")
        );
        assert_eq!(output_image_path(dir, "img001", ""), dir.join("img001.png"));
    }

    #[test]
    fn sample_name_strips_directory_and_extension() {
        assert_eq!(sample_name(Path::new("/data/Set5/HR/baby.png")), "baby");
        assert_eq!(sample_name(Path::new("bird.x4.bmp")), "bird.x4");
    }

    #[test]
    fn image_extensions() {
        assert!(is_image_extension(Path::new("a.PNG")));
        assert!(is_image_extension(Path::new("a.jpeg")));
        assert!(!is_image_extension(Path::new("a.txt")));
        assert!(!is_image_extension(Path::new("png")));
    }

    #[test]
    fn modcrop_trims_to_multiple_of_scale() {
        let device = Default::default();
        let t = Tensor::<B, 4>::zeros([1, 3, 10, 13], &device);
        assert_eq!(modcrop(t, 4).unwrap().dims(), [1, 3, 8, 12]);
        let t = Tensor::<B, 4>::zeros([1, 1, 8, 8], &device);
        assert_eq!(modcrop(t, 4).unwrap().dims(), [1, 1, 8, 8]);
        let t = Tensor::<B, 4>::zeros([1, 1, 3, 8], &device);
        assert!(modcrop(t, 4).is_err());
    }

    #[test]
    fn tensor_to_image_quantizes_and_clamps() {
        let device = Default::default();
        let data = vec![0.0f32, 0.5, 1.5, -0.2, 1.0, 0.25];
        let t = Tensor::<B, 4>::from_data(TensorData::new(data, [1, 1, 2, 3]), &device);
        let img = tensor_to_image(&t).unwrap();
        let gray = img.to_luma8();
        assert_eq!(gray.as_raw(), &vec![0u8, 128, 255, 0, 255, 64]);
    }

    #[test]
    fn rgb_tensor_roundtrips_through_array() {
        let device = Default::default();
        // 1x2 RGB: red, then blue
        let data = vec![1.0f32, 0.0, 0.0, 0.0, 0.0, 1.0];
        let t = Tensor::<B, 4>::from_data(TensorData::new(data, [1, 3, 1, 2]), &device);
        let arr = image_to_array(&tensor_to_image(&t).unwrap());
        assert_eq!(arr.dim(), (1, 2, 3));
        assert_eq!(arr[[0, 0, 0]], 255.0);
        assert_eq!(arr[[0, 1, 2]], 255.0);
        assert_eq!(arr[[0, 1, 0]], 0.0);
    }

    #[test]
    fn luma_of_white_and_black() {
        let mut img = Array3::<f64>::zeros((1, 2, 3));
        img[[0, 1, 0]] = 255.0;
        img[[0, 1, 1]] = 255.0;
        img[[0, 1, 2]] = 255.0;
        let y = rgb_to_y(&img).unwrap();
        assert_eq!(y.dim(), (1, 2, 1));
        assert!((y[[0, 0, 0]] - 16.0).abs() < 1e-9);
        assert!((y[[0, 1, 0]] - 235.0).abs() < 1e-9);
        assert!(rgb_to_y(&Array3::zeros((2, 2, 1))).is_err());
    }
}
