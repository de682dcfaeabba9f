use burn::data::dataset::transform::Mapper;
use image::{imageops, RgbImage};
use rand::Rng;

use crate::data::VocItem;

/// Fraction of each spatial dimension kept by the test-time center crop.
pub const CENTER_FRACTION: f64 = 0.875;

/// Crops a `size` x `size` window at a uniformly random offset. An axis
/// shorter than `size` is kept whole.
pub fn random_crop<R: Rng + ?Sized>(image: &RgbImage, size: u32, rng: &mut R) -> RgbImage {
    let (width, height) = image.dimensions();
    let crop_width = size.min(width);
    let crop_height = size.min(height);

    let x = rng.gen_range(0..=width - crop_width);
    let y = rng.gen_range(0..=height - crop_height);

    imageops::crop_imm(image, x, y, crop_width, crop_height).to_image()
}

/// Mirrors the image left-right with probability 0.5.
pub fn random_flip<R: Rng + ?Sized>(image: RgbImage, rng: &mut R) -> RgbImage {
    if rng.gen_bool(0.5) {
        imageops::flip_horizontal(&image)
    } else {
        image
    }
}

/// Side length left after cropping `side` to its central `fraction`.
pub fn center_crop_size(side: u32, fraction: f64) -> u32 {
    side - 2 * center_crop_offset(side, fraction)
}

fn center_crop_offset(side: u32, fraction: f64) -> u32 {
    ((side as f64 - side as f64 * fraction) / 2.0).floor() as u32
}

pub fn center_crop(image: &RgbImage, fraction: f64) -> RgbImage {
    let (width, height) = image.dimensions();
    let x = center_crop_offset(width, fraction);
    let y = center_crop_offset(height, fraction);

    imageops::crop_imm(image, x, y, width - 2 * x, height - 2 * y).to_image()
}

/// Training-time transform: random crop followed by a random flip.
pub fn train_transform<R: Rng + ?Sized>(item: VocItem, crop_size: u32, rng: &mut R) -> VocItem {
    let image = random_crop(&item.image, crop_size, rng);
    VocItem {
        image: random_flip(image, rng),
        ..item
    }
}

/// Test-time transform, applied lazily by the test data loader.
#[derive(Debug, Clone, Copy)]
pub struct CenterCrop {
    fraction: f64,
}

impl CenterCrop {
    pub fn new(fraction: f64) -> Self {
        Self { fraction }
    }
}

impl Mapper<VocItem, VocItem> for CenterCrop {
    fn map(&self, item: &VocItem) -> VocItem {
        VocItem {
            image: center_crop(&item.image, self.fraction),
            labels: item.labels.clone(),
            weights: item.weights.clone(),
        }
    }
}
