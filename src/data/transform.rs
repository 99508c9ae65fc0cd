use image::imageops::{self, FilterType};
use image::RgbImage;
use rand::Rng;
use std::path::Path;
use tracing::warn;

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

const CROP_SCALE: (f64, f64) = (0.08, 1.0);
const CROP_RATIO: (f64, f64) = (3.0 / 4.0, 4.0 / 3.0);
const JITTER: f32 = 0.2;

/// Decode an image as RGB, or a black `size`x`size` placeholder if it cannot
/// be read.
pub fn load_rgb(path: &Path, size: u32) -> RgbImage {
    match image::open(path) {
        Ok(img) => img.to_rgb8(),
        Err(e) => {
            warn!("Failed to load image {:?}: {}", path, e);
            RgbImage::new(size, size)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Augment {
    /// Random resized crop, horizontal flip and color jitter.
    Train,
    /// Resize the shorter side, then center crop.
    Eval,
}

/// Turns a decoded image into a normalized CHW float buffer of fixed size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageTransform {
    size: u32,
    mode: Augment,
}

impl ImageTransform {
    pub fn train(size: u32) -> Self {
        Self {
            size,
            mode: Augment::Train,
        }
    }

    pub fn eval(size: u32) -> Self {
        Self {
            size,
            mode: Augment::Eval,
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn values_per_image(&self) -> usize {
        3 * (self.size as usize) * (self.size as usize)
    }

    pub fn apply<R: Rng>(&self, img: &RgbImage, rng: &mut R) -> Vec<f32> {
        match self.mode {
            Augment::Train => {
                let mut cropped = random_resized_crop(img, self.size, rng);
                if rng.gen_bool(0.5) {
                    cropped = imageops::flip_horizontal(&cropped);
                }
                let mut chw = to_unit_chw(&cropped);
                color_jitter(&mut chw, rng);
                normalize(&mut chw);
                chw
            }
            Augment::Eval => {
                // 256/224 resize-then-crop ratio, scaled to the target size.
                let resized = resize_shorter(img, self.size * 256 / 224);
                let cropped = center_crop(&resized, self.size);
                let mut chw = to_unit_chw(&cropped);
                normalize(&mut chw);
                chw
            }
        }
    }
}

fn pixel_area(width: u32, height: u32) -> f64 {
    width as f64 * height as f64
}

fn random_resized_crop<R: Rng>(img: &RgbImage, size: u32, rng: &mut R) -> RgbImage {
    let (width, height) = img.dimensions();
    let area = pixel_area(width, height);

    for _ in 0..10 {
        let target_area = area * rng.gen_range(CROP_SCALE.0..=CROP_SCALE.1);
        let aspect = rng
            .gen_range(CROP_RATIO.0.ln()..=CROP_RATIO.1.ln())
            .exp();
        let w = (target_area * aspect).sqrt().round() as u32;
        let h = (target_area / aspect).sqrt().round() as u32;

        if w > 0 && h > 0 && w <= width && h <= height {
            let x = rng.gen_range(0..=width - w);
            let y = rng.gen_range(0..=height - h);
            let crop = imageops::crop_imm(img, x, y, w, h).to_image();
            return imageops::resize(&crop, size, size, FilterType::Triangle);
        }
    }

    let side = width.min(height).max(1);
    let crop = center_crop(img, side);
    imageops::resize(&crop, size, size, FilterType::Triangle)
}

fn resize_shorter(img: &RgbImage, target: u32) -> RgbImage {
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return RgbImage::new(target, target);
    }
    let (w, h) = if width <= height {
        let h = (height as u64 * target as u64 / width as u64).max(1) as u32;
        (target, h)
    } else {
        let w = (width as u64 * target as u64 / height as u64).max(1) as u32;
        (w, target)
    };
    imageops::resize(img, w, h, FilterType::Triangle)
}

fn center_crop(img: &RgbImage, size: u32) -> RgbImage {
    let (width, height) = img.dimensions();
    if width < size || height < size {
        return imageops::resize(img, size, size, FilterType::Triangle);
    }
    let x = (width - size) / 2;
    let y = (height - size) / 2;
    imageops::crop_imm(img, x, y, size, size).to_image()
}

/// Planar RGB in `[0, 1]`.
fn to_unit_chw(img: &RgbImage) -> Vec<f32> {
    let plane = (img.width() * img.height()) as usize;
    let mut out = vec![0.0f32; 3 * plane];
    for (i, pixel) in img.pixels().enumerate() {
        for c in 0..3 {
            out[c * plane + i] = pixel[c] as f32 / 255.0;
        }
    }
    out
}

fn color_jitter<R: Rng>(chw: &mut [f32], rng: &mut R) {
    let plane = chw.len() / 3;
    if plane == 0 {
        return;
    }
    let brightness = rng.gen_range(1.0 - JITTER..=1.0 + JITTER);
    let contrast = rng.gen_range(1.0 - JITTER..=1.0 + JITTER);
    let saturation = rng.gen_range(1.0 - JITTER..=1.0 + JITTER);

    for v in chw.iter_mut() {
        *v = (*v * brightness).clamp(0.0, 1.0);
    }

    let mean_gray = (0..plane).map(|i| gray(chw, plane, i)).sum::<f32>() / plane as f32;
    for v in chw.iter_mut() {
        *v = ((*v - mean_gray) * contrast + mean_gray).clamp(0.0, 1.0);
    }

    for i in 0..plane {
        let g = gray(chw, plane, i);
        for c in 0..3 {
            let v = &mut chw[c * plane + i];
            *v = ((*v - g) * saturation + g).clamp(0.0, 1.0);
        }
    }
}

fn gray(chw: &[f32], plane: usize, i: usize) -> f32 {
    0.299 * chw[i] + 0.587 * chw[plane + i] + 0.114 * chw[2 * plane + i]
}

fn normalize(chw: &mut [f32]) {
    let plane = chw.len() / 3;
    for c in 0..3 {
        for v in &mut chw[c * plane..(c + 1) * plane] {
            *v = (*v - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tempfile::TempDir;

    fn solid(width: u32, height: u32, color: [u8; 3]) -> RgbImage {
        RgbImage::from_pixel(width, height, Rgb(color))
    }

    #[test]
    fn test_eval_transform_shape_and_normalization() {
        let transform = ImageTransform::eval(32);
        let img = solid(80, 48, [255, 0, 0]);
        let out = transform.apply(&img, &mut StdRng::seed_from_u64(0));

        assert_eq!(out.len(), transform.values_per_image());
        let plane = 32 * 32;
        let red = (1.0 - IMAGENET_MEAN[0]) / IMAGENET_STD[0];
        let green = (0.0 - IMAGENET_MEAN[1]) / IMAGENET_STD[1];
        assert!((out[0] - red).abs() < 1e-4);
        assert!((out[plane] - green).abs() < 1e-4);
    }

    #[test]
    fn test_pixel_area_of_huge_image() {
        assert_eq!(pixel_area(70_000, 70_000), 4.9e9);
        assert_eq!(pixel_area(u32::MAX, 2), 2.0 * u32::MAX as f64);
    }

    #[test]
    fn test_train_transform_is_seeded() {
        let transform = ImageTransform::train(32);
        let mut img = solid(64, 64, [10, 200, 30]);
        img.put_pixel(3, 5, Rgb([250, 250, 250]));

        let a = transform.apply(&img, &mut StdRng::seed_from_u64(9));
        let b = transform.apply(&img, &mut StdRng::seed_from_u64(9));
        assert_eq!(a.len(), 3 * 32 * 32);
        assert_eq!(a, b);
    }

    #[test]
    fn test_resize_shorter_keeps_aspect() {
        let resized = resize_shorter(&solid(200, 100, [0, 0, 0]), 50);
        assert_eq!(resized.dimensions(), (100, 50));
    }

    #[test]
    fn test_unreadable_image_becomes_placeholder() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.jpg");
        std::fs::write(&path, b"not an image").unwrap();

        let img = load_rgb(&path, 16);
        assert_eq!(img.dimensions(), (16, 16));
        assert!(img.pixels().all(|p| p.0 == [0, 0, 0]));

        let missing = load_rgb(&dir.path().join("missing.png"), 8);
        assert_eq!(missing.dimensions(), (8, 8));
    }
}
