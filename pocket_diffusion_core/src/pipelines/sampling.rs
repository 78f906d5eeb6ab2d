use std::f64::consts::PI;

use candle_core::{Device, Tensor};
use pocket_diffusion_common::{Result, LATENT_CHANNELS, VAE_SCALE_FACTOR};
use rand::{rngs::StdRng, Rng, SeedableRng};

use super::decoder::LATENT_SCALING_FACTOR;

/// Seeds above zero are used as given, anything else draws a fresh seed in `[0, 100000)`.
#[allow(clippy::cast_sign_loss)]
pub fn resolve_seed(seed: i64) -> u64 {
    if seed > 0 {
        seed as u64
    } else {
        rand::thread_rng().gen_range(0..100_000)
    }
}

/// Scaled standard normal noise of shape `[4, size / 8, size / 8]`, drawn with Box-Muller.
#[allow(clippy::cast_possible_truncation)]
pub fn get_noise(seed: u64, image_size: usize) -> Result<Tensor> {
    let side = image_size / VAE_SCALE_FACTOR;
    let mut rng = StdRng::seed_from_u64(seed);
    let data = (0..LATENT_CHANNELS * side * side)
        .map(|_| {
            // `gen` is in [0, 1), flip it so the log never sees zero.
            let u1 = 1.0 - rng.gen::<f32>();
            let u2 = rng.gen::<f32>();
            let r = (-2.0 * f64::from(u1).ln()).sqrt();
            (r * (2.0 * PI * f64::from(u2)).cos()) as f32 * LATENT_SCALING_FACTOR
        })
        .collect::<Vec<f32>>();
    Ok(Tensor::from_vec(data, (LATENT_CHANNELS, side, side), &Device::Cpu)?)
}
