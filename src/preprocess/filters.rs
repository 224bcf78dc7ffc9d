//! Pure image transforms used before detection.

use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::contrast;
use imageproc::filter::bilateral::GaussianEuclideanColorDistance;
use imageproc::filter::bilateral_filter;
use imageproc::map::map_pixels as map_colors;
use imageproc::stats::histogram;

/// Tunables for `equalize_luminance` and `bilateral_smooth`.
#[derive(Clone, Copy, Debug)]
pub struct FilterParams {
    /// Histogram clip limit, as a multiple of the mean bin height.
    pub clip_limit: f32,
    /// Bilateral neighbourhood diameter in pixels.
    pub diameter: u32,
    pub sigma_color: f32,
    pub sigma_space: f32,
}

impl Default for FilterParams {
    fn default() -> Self {
        Self {
            clip_limit: 2.0,
            diameter: 9,
            sigma_color: 75.0,
            sigma_space: 75.0,
        }
    }
}

/// Contrast-limited histogram equalization of the HSV value channel.
///
/// Every pixel is rescaled by `v' / v` so hue and saturation are preserved.
/// A `clip_limit` of zero or less is plain histogram equalization.
pub fn equalize_luminance(img: &RgbImage, clip_limit: f32) -> RgbImage {
    if img.width() == 0 || img.height() == 0 {
        return img.clone();
    }
    let value: GrayImage = map_colors(img, |px: Rgb<u8>| Luma([value_of(&px)]));

    let lut = if clip_limit > 0.0 {
        clipped_lut(&value, clip_limit)
    } else {
        let equalized = contrast::equalize_histogram(&value);
        let mut lut = [0u8; 256];
        for (v, e) in value.pixels().zip(equalized.pixels()) {
            lut[v.0[0] as usize] = e.0[0];
        }
        lut
    };

    map_colors(img, |px: Rgb<u8>| {
        let v = value_of(&px);
        if v == 0 {
            return px;
        }
        let scale = lut[v as usize] as f32 / v as f32;
        Rgb(px.0.map(|c| clamp_to_u8(c as f32 * scale)))
    })
}

/// Equalization table from a histogram whose bins are capped at
/// `clip_limit` times the mean bin height, excess spread evenly.
fn clipped_lut(value: &GrayImage, clip_limit: f32) -> [u8; 256] {
    let bins = &histogram(value).channels[0];
    let total = value.width() as f64 * value.height() as f64;
    let limit = (clip_limit as f64 * total / 256.0).max(1.0);
    let excess: f64 = bins
        .iter()
        .map(|&count| (count as f64 - limit).max(0.0))
        .sum();
    let share = excess / 256.0;

    let mut lut = [0u8; 256];
    let mut acc = 0.0;
    for (slot, &count) in lut.iter_mut().zip(bins.iter()) {
        acc += (count as f64).min(limit) + share;
        *slot = (255.0 * acc / total).round().clamp(0.0, 255.0) as u8;
    }
    lut
}

/// Edge-preserving bilateral filter; Gaussian weights on spatial distance
/// and on Euclidean colour distance.
pub fn bilateral_smooth(img: &RgbImage, params: &FilterParams) -> RgbImage {
    if img.width() == 0 || img.height() == 0 || params.diameter <= 1 {
        return img.clone();
    }
    let radius = (params.diameter / 2).min(u8::MAX as u32) as u8;
    bilateral_filter(
        img,
        radius,
        params.sigma_space,
        GaussianEuclideanColorDistance::new(params.sigma_color),
    )
}

fn value_of(px: &Rgb<u8>) -> u8 {
    px.0[0].max(px.0[1]).max(px.0[2])
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
