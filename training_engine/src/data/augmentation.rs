// training_engine/src/data/augmentation.rs

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![deny(unsafe_code, clippy::unwrap_used, clippy::expect_used)]

//! Multi-crop аугментации.
//!
//! Из одного изображения получаются два глобальных вида и `3 * per_band`
//! локальных. Локальные виды нарезаются из трех горизонтальных полос
//! (верхняя половина, средняя половина, нижняя половина) и идут в порядке
//! полос: сначала все виды полосы 0, затем полосы 1 и 2.
//!
//! Цепочки преобразований:
//! - глобальный вид 0: случайный кроп, отражение, цветовые искажения, размытие (p = 1.0);
//! - глобальный вид 1: то же с размытием p = 0.1 и соляризацией p = 0.2;
//! - локальный вид: случайный кроп полосы, отражение, цветовые искажения, размытие p = 0.5.

use image::{
    imageops::{self, FilterType},
    DynamicImage, Rgb32FImage, RgbImage,
};
use rand::{seq::SliceRandom, Rng};
use utils_crate::config::{MultiCropSection, NUM_BANDS};

use crate::TrainingError;

/// Среднее ImageNet по каналам.
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// Стандартное отклонение ImageNet по каналам.
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

const RATIO_RANGE: (f64, f64) = (3.0 / 4.0, 4.0 / 3.0);
const CROP_ATTEMPTS: usize = 10;
const FLIP_PROB: f64 = 0.5;
const JITTER_PROB: f64 = 0.8;
const BRIGHTNESS: f32 = 0.4;
const CONTRAST: f32 = 0.4;
const SATURATION: f32 = 0.2;
const HUE: f32 = 0.1;
const GRAYSCALE_PROB: f64 = 0.2;
const BLUR_SIGMA: (f32, f32) = (0.1, 2.0);
const SOLARIZE_PROB: f64 = 0.2;
const SOLARIZE_THRESHOLD: f32 = 128.0 / 255.0;

/// Один нормализованный вид в раскладке `[C, H, W]`.
#[derive(Debug, Clone, PartialEq)]
pub struct AugmentedView {
    /// Значения пикселей по каналам.
    pub data: Vec<f32>,
    /// Высота.
    pub height: usize,
    /// Ширина.
    pub width: usize,
}

/// Параметры одной цепочки преобразований.
#[derive(Debug, Clone, Copy)]
struct ViewRecipe {
    size: (usize, usize),
    scale: (f64, f64),
    blur_prob: f64,
    solarize_prob: f64,
}

/// Генератор видов одного изображения.
#[derive(Debug, Clone)]
pub struct MultiCropAugmentation {
    global: [ViewRecipe; 2],
    local: ViewRecipe,
    per_band: usize,
}

impl MultiCropAugmentation {
    /// Создает аугментацию из секции конфигурации.
    #[must_use]
    pub fn from_config(section: &MultiCropSection) -> Self {
        let global = |blur_prob, solarize_prob| ViewRecipe {
            size: section.global_size,
            scale: section.global_crops_scale,
            blur_prob,
            solarize_prob,
        };
        Self {
            global: [global(1.0, 0.0), global(0.1, SOLARIZE_PROB)],
            local: ViewRecipe {
                size: section.local_size,
                scale: section.local_crops_scale,
                blur_prob: 0.5,
                solarize_prob: 0.0,
            },
            per_band: section.local_crops_per_band(),
        }
    }

    /// Число видов на изображение.
    #[must_use]
    pub const fn num_views(&self) -> usize {
        2 + NUM_BANDS * self.per_band
    }

    /// Размер вида по его номеру.
    #[must_use]
    pub const fn view_size(&self, view: usize) -> (usize, usize) {
        if view < 2 {
            self.global[0].size
        } else {
            self.local.size
        }
    }

    /// Строит все виды изображения.
    ///
    /// # Аргументы
    /// * `image` - Исходное изображение.
    /// * `rng` - Генератор случайных чисел этого примера.
    ///
    /// # Возвращает
    /// `[global_0, global_1, local_0 .. local_{K-1}]`.
    ///
    /// # Ошибки
    /// `TrainingError::Data` для пустого изображения.
    pub fn apply<R: Rng>(&self, image: &RgbImage, rng: &mut R) -> Result<Vec<AugmentedView>, TrainingError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(TrainingError::Data("Пустое изображение.".to_string()));
        }
        let mut views = Vec::with_capacity(self.num_views());
        for recipe in &self.global {
            views.push(transform(image, *recipe, rng));
        }
        if self.per_band > 0 {
            for band in 0..NUM_BANDS {
                let (top, band_height) = band_rows(height, band);
                let strip = imageops::crop_imm(image, 0, top, width, band_height).to_image();
                for _ in 0..self.per_band {
                    views.push(transform(&strip, self.local, rng));
                }
            }
        }
        Ok(views)
    }
}

/// Строки полосы: `[0, h/2)`, `[h/4, h/4 + h/2)`, `[h/2, h/2 + h/2)`.
#[allow(clippy::cast_possible_truncation)]
fn band_rows(height: u32, band: usize) -> (u32, u32) {
    let half = (height / 2).max(1);
    let top = match band {
        0 => 0,
        1 => height / 4,
        _ => height / 2,
    };
    let top = top.min(height - 1);
    (top, half.min(height - top))
}

fn transform<R: Rng>(image: &RgbImage, recipe: ViewRecipe, rng: &mut R) -> AugmentedView {
    let (out_h, out_w) = recipe.size;
    let cropped = random_resized_crop(image, recipe.scale, rng);
    #[allow(clippy::cast_possible_truncation)]
    let resized = imageops::resize(&cropped, out_w as u32, out_h as u32, FilterType::CatmullRom);
    let mut pixels = DynamicImage::ImageRgb8(resized).into_rgb32f();

    if rng.random_bool(FLIP_PROB) {
        imageops::flip_horizontal_in_place(&mut pixels);
    }
    if rng.random_bool(JITTER_PROB) {
        color_jitter(&mut pixels, rng);
    }
    if rng.random_bool(GRAYSCALE_PROB) {
        grayscale(&mut pixels);
    }
    if recipe.blur_prob > 0.0 && rng.random_bool(recipe.blur_prob) {
        let sigma = rng.random_range(BLUR_SIGMA.0..BLUR_SIGMA.1);
        pixels = imageops::blur(&pixels, sigma);
    }
    if recipe.solarize_prob > 0.0 && rng.random_bool(recipe.solarize_prob) {
        solarize(&mut pixels);
    }
    normalize(&pixels)
}

/// Случайный кроп с площадью из `scale` и соотношением сторон из `[3/4, 4/3]`.
///
/// После десяти неудачных попыток берется центральный кроп с допустимым соотношением сторон.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn random_resized_crop<R: Rng>(image: &RgbImage, scale: (f64, f64), rng: &mut R) -> RgbImage {
    let (width, height) = image.dimensions();
    let area = f64::from(width) * f64::from(height);
    let log_ratio = (RATIO_RANGE.0.ln(), RATIO_RANGE.1.ln());

    for _ in 0..CROP_ATTEMPTS {
        let target_area = area * sample(rng, scale);
        let ratio = sample(rng, log_ratio).exp();
        let w = (target_area * ratio).sqrt().round() as u32;
        let h = (target_area / ratio).sqrt().round() as u32;
        if w > 0 && h > 0 && w <= width && h <= height {
            let y = rng.random_range(0..=height - h);
            let x = rng.random_range(0..=width - w);
            return imageops::crop_imm(image, x, y, w, h).to_image();
        }
    }

    let in_ratio = f64::from(width) / f64::from(height);
    let (w, h) = if in_ratio < RATIO_RANGE.0 {
        (width, (f64::from(width) / RATIO_RANGE.0).round() as u32)
    } else if in_ratio > RATIO_RANGE.1 {
        ((f64::from(height) * RATIO_RANGE.1).round() as u32, height)
    } else {
        (width, height)
    };
    let (w, h) = (w.clamp(1, width), h.clamp(1, height));
    imageops::crop_imm(image, (width - w) / 2, (height - h) / 2, w, h).to_image()
}

fn sample<R: Rng>(rng: &mut R, (lo, hi): (f64, f64)) -> f64 {
    if hi > lo {
        rng.random_range(lo..hi)
    } else {
        lo
    }
}

fn luma([r, g, b]: [f32; 3]) -> f32 {
    0.299f32.mul_add(r, 0.587f32.mul_add(g, 0.114 * b))
}

fn blend(value: f32, other: f32, factor: f32) -> f32 {
    factor.mul_add(value - other, other).clamp(0.0, 1.0)
}

/// Яркость, контраст, насыщенность и тон в случайном порядке.
#[allow(clippy::cast_precision_loss)]
fn color_jitter<R: Rng>(pixels: &mut Rgb32FImage, rng: &mut R) {
    let mut order = [0_u8, 1, 2, 3];
    order.shuffle(rng);
    for op in order {
        match op {
            0 => {
                let factor = rng.random_range(1.0 - BRIGHTNESS..1.0 + BRIGHTNESS);
                for p in pixels.pixels_mut() {
                    p.0 = p.0.map(|c| (c * factor).clamp(0.0, 1.0));
                }
            }
            1 => {
                let factor = rng.random_range(1.0 - CONTRAST..1.0 + CONTRAST);
                let count = (pixels.width() * pixels.height()).max(1) as f32;
                let mean = pixels.pixels().map(|p| luma(p.0)).sum::<f32>() / count;
                for p in pixels.pixels_mut() {
                    p.0 = p.0.map(|c| blend(c, mean, factor));
                }
            }
            2 => {
                let factor = rng.random_range(1.0 - SATURATION..1.0 + SATURATION);
                for p in pixels.pixels_mut() {
                    let gray = luma(p.0);
                    p.0 = p.0.map(|c| blend(c, gray, factor));
                }
            }
            _ => {
                let shift = rng.random_range(-HUE..HUE);
                for p in pixels.pixels_mut() {
                    p.0 = shift_hue(p.0, shift);
                }
            }
        }
    }
}

fn shift_hue([r, g, b]: [f32; 3], shift: f32) -> [f32; 3] {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;
    if delta <= f32::EPSILON {
        return [r, g, b];
    }
    let sector = if (max - r).abs() <= f32::EPSILON {
        ((g - b) / delta).rem_euclid(6.0)
    } else if (max - g).abs() <= f32::EPSILON {
        (b - r) / delta + 2.0
    } else {
        (r - g) / delta + 4.0
    };
    let hue = sector / 6.0;
    let saturation = delta / max;
    hsv_to_rgb((hue + shift).rem_euclid(1.0), saturation, max)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn hsv_to_rgb(h: f32, s: f32, v: f32) -> [f32; 3] {
    let sector = h * 6.0;
    let i = sector.floor();
    let f = sector - i;
    let p = v * (1.0 - s);
    let q = v * s.mul_add(-f, 1.0);
    let t = v * s.mul_add(-(1.0 - f), 1.0);
    match (i as u32) % 6 {
        0 => [v, t, p],
        1 => [q, v, p],
        2 => [p, v, t],
        3 => [p, q, v],
        4 => [t, p, v],
        _ => [v, p, q],
    }
}

fn grayscale(pixels: &mut Rgb32FImage) {
    for p in pixels.pixels_mut() {
        let gray = luma(p.0);
        p.0 = [gray; 3];
    }
}

fn solarize(pixels: &mut Rgb32FImage) {
    for p in pixels.pixels_mut() {
        p.0 = p.0.map(|c| if c >= SOLARIZE_THRESHOLD { 1.0 - c } else { c });
    }
}

fn normalize(pixels: &Rgb32FImage) -> AugmentedView {
    let (width, height) = pixels.dimensions();
    let plane = (width * height) as usize;
    let mut data = vec![0.0_f32; 3 * plane];
    for (i, p) in pixels.pixels().enumerate() {
        for c in 0..3 {
            data[c * plane + i] = (p.0[c] - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
        }
    }
    AugmentedView {
        data,
        height: height as usize,
        width: width as usize,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bands_cover_halves() {
        assert_eq!(band_rows(100, 0), (0, 50));
        assert_eq!(band_rows(100, 1), (25, 50));
        assert_eq!(band_rows(100, 2), (50, 50));
        assert_eq!(band_rows(1, 2), (0, 1));
    }

    #[test]
    fn hue_shift_by_zero_keeps_color() {
        let rgb = [0.8, 0.3, 0.1];
        let shifted = shift_hue(rgb, 0.0);
        for (a, b) in rgb.iter().zip(shifted) {
            assert!((a - b).abs() < 1e-5);
        }
    }
}
