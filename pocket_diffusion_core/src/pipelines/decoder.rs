use candle_core::Tensor;
use image::{imageops::FilterType, DynamicImage, RgbaImage};
use pocket_diffusion_common::{Error, ModuleInputs, Role, LATENT_SAMPLE};
use rayon::prelude::*;

use crate::{
    models::{require, ModuleProvider},
    DiffusionError, Result,
};

/// Scale applied to latents so they have roughly unit variance.
pub const LATENT_SCALING_FACTOR: f32 = 0.18215;

/// Map a `[-1, 1]` sample to an 8 bit channel.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn to_channel(v: f32) -> u8 {
    ((v + 1.0) * 127.5).round().clamp(0.0, 255.0) as u8
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LatentDecoder;

impl LatentDecoder {
    /// Decode a `[4, h, w]` latent into an opaque `target_size` x `target_size` RGBA image.
    #[allow(clippy::cast_possible_truncation)]
    pub fn decode(
        &self,
        modules: &dyn ModuleProvider,
        latent: Tensor,
        target_size: u32,
    ) -> Result<DynamicImage> {
        let decoder = require(modules, Role::Decoder)?;
        let decode = || -> pocket_diffusion_common::Result<RgbaImage> {
            let (c, h, w) = latent.dims3()?;
            let latent = latent
                .affine(f64::from(1.0f32 / LATENT_SCALING_FACTOR), 0.)?
                .reshape((1, c, h, w))?;
            let out = decoder.forward(ModuleInputs::new().with(LATENT_SAMPLE, latent))?;
            let (b, channels, out_h, out_w) = out.dims4()?;
            if b != 1 || channels != 3 {
                return Err(Error::UnexpectedShape {
                    expected: vec![1, 3, out_h, out_w],
                    got: out.dims().to_vec(),
                });
            }
            if out_h == 0 || out_w == 0 {
                return Err(Error::msg(format!(
                    "decoder produced an empty image of shape {:?}",
                    out.dims()
                )));
            }

            let data = out.flatten_all()?.to_vec1::<f32>()?;
            let plane = out_h * out_w;
            let mut pixels = vec![0u8; plane * 4];
            pixels.par_chunks_mut(4).enumerate().for_each(|(i, px)| {
                px[0] = to_channel(data[i]);
                px[1] = to_channel(data[plane + i]);
                px[2] = to_channel(data[2 * plane + i]);
                px[3] = u8::MAX;
            });
            RgbaImage::from_raw(out_w as u32, out_h as u32, pixels)
                .ok_or_else(|| Error::msg("RgbaImage has invalid capacity."))
        };

        let mut image = decode().map_err(DiffusionError::Decode)?;
        if image.dimensions() != (target_size, target_size) {
            image = image::imageops::resize(&image, target_size, target_size, FilterType::Triangle);
        }
        Ok(DynamicImage::ImageRgba8(image))
    }
}
