mod common;

use std::sync::{Arc, Mutex};

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use common::Fixture;
use pocket_diffusion_common::{InferenceModule, ModuleInputs, Role, MAX_TOKEN_LENGTH, TEXT_EMBED_DIM};
use pocket_diffusion_core::{
    DenoisingStepEngine, DiffusionError, EmbeddingEncoder, GenerationRequest, GuidanceEmbeddings,
    LatentDecoder, LinearPlaceholderScheduler, ModuleProvider, Pipeline, Scheduler,
};

fn recorder() -> (
    Arc<Mutex<Vec<(f32, String)>>>,
    impl Fn(f32, &str) + Send + Sync,
) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = {
        let events = events.clone();
        move |progress: f32, message: &str| {
            events.lock().unwrap().push((progress, message.to_string()));
        }
    };
    (events, sink)
}

fn red_fox() -> GenerationRequest {
    GenerationRequest::new("a red fox")
        .with_steps(5)
        .with_guidance_scale(7.5)
        .with_image_size(256)
        .with_seed(42)
}

#[test]
fn zero_modules_give_a_mid_gray_image() -> Result<()> {
    let fx = Fixture::new("mid_gray");
    fx.manager.ensure_loaded()?;
    let pipeline = Pipeline::new(fx.manager.clone(), true);

    let result = pipeline.forward(&red_fox(), &|_: f32, _: &str| {})?;
    assert_eq!(result.seed, 42);
    assert_eq!(result.prompt, "a red fox");

    let image = result.image.to_rgba8();
    assert_eq!(image.dimensions(), (256, 256));
    assert!(image.pixels().all(|p| p.0 == [128, 128, 128, 255]));

    let again = pipeline.forward(&red_fox(), &|_: f32, _: &str| {})?;
    assert_eq!(again.image.to_rgba8(), image);
    Ok(())
}

#[test]
fn decoder_output_maps_through_the_channel_formula() -> Result<()> {
    let fx = Fixture::with_fill("half_fill", 0.5);
    fx.manager.ensure_loaded()?;
    let pipeline = Pipeline::new(fx.manager.clone(), true);

    let result = pipeline.forward(&red_fox().with_image_size(384), &|_: f32, _: &str| {})?;
    let image = result.image.to_rgba8();
    assert_eq!(image.dimensions(), (384, 384));
    // round((0.5 + 1) * 127.5) = 191
    assert!(image.pixels().all(|p| p.0 == [191, 191, 191, 255]));
    Ok(())
}

#[test]
fn progress_follows_the_generation_phases() -> Result<()> {
    let fx = Fixture::new("progress");
    fx.manager.ensure_loaded()?;
    let pipeline = Pipeline::new(fx.manager.clone(), true);
    let (events, sink) = recorder();

    pipeline.forward(&red_fox(), &sink)?;

    let events = events.lock().unwrap();
    let messages = events.iter().map(|(_, m)| m.as_str()).collect::<Vec<_>>();
    assert_eq!(
        messages,
        [
            "Starting generation...",
            "Encoding prompt...",
            "Initializing noise...",
            "Denoising: step 1/5",
            "Denoising: step 2/5",
            "Denoising: step 3/5",
            "Denoising: step 4/5",
            "Denoising: step 5/5",
            "Decoding image...",
            "Generation complete!",
        ]
    );
    assert_eq!(events[0].0, 0.0);
    assert_eq!(events[1].0, 0.05);
    assert_eq!(events[2].0, 0.1);
    assert!((events[7].0 - 0.9).abs() < 1e-6);
    assert_eq!(events[8].0, 0.9);
    assert_eq!(events[9].0, 1.0);
    assert!(events.windows(2).all(|w| w[0].0 <= w[1].0 + 1e-6));
    Ok(())
}

#[test]
fn generation_requires_loaded_models() {
    let fx = Fixture::new("not_loaded");
    let pipeline = Pipeline::new(fx.manager.clone(), true);
    let (events, sink) = recorder();

    let res = pipeline.forward(&red_fox(), &sink);
    assert!(matches!(res, Err(DiffusionError::ModelNotLoaded(None))));
    assert_eq!(fx.loader.loads(), 0);

    let events = events.lock().unwrap();
    let (progress, message) = events.last().unwrap();
    assert_eq!(*progress, 0.0);
    assert!(message.starts_with("Error: "), "{message}");
}

#[test]
fn denoiser_failure_carries_the_timestep() -> Result<()> {
    let fx = Fixture::new("broken_denoiser");
    fx.loader.break_forward(Role::Denoiser);
    fx.manager.ensure_loaded()?;
    let pipeline = Pipeline::new(fx.manager.clone(), true);
    let (events, sink) = recorder();

    match pipeline.forward(&red_fox(), &sink) {
        Err(DiffusionError::Denoising { timestep, .. }) => assert_eq!(timestep, 999),
        other => panic!("expected a denoising failure, got {other:?}"),
    }

    let events = events.lock().unwrap();
    assert!(!events.iter().any(|(_, m)| m.starts_with("Denoising: step")));
    assert!(events
        .last()
        .unwrap()
        .1
        .starts_with("Error: denoising failed at timestep 999"));

    // The lease is returned even though generation failed.
    assert_eq!(fx.manager.lease_count(), 0);
    fx.manager.try_unload()?;
    Ok(())
}

#[test]
fn decoder_failure_is_reported() -> Result<()> {
    let fx = Fixture::new("broken_decoder");
    fx.loader.break_forward(Role::Decoder);
    fx.manager.ensure_loaded()?;
    let pipeline = Pipeline::new(fx.manager.clone(), true);

    let res = pipeline.forward(&red_fox(), &|_: f32, _: &str| {});
    assert!(matches!(res, Err(DiffusionError::Decode(_))));
    Ok(())
}

#[test]
fn random_seeds_are_recorded() -> Result<()> {
    let fx = Fixture::new("random_seed");
    fx.manager.ensure_loaded()?;
    let pipeline = Pipeline::new(fx.manager.clone(), true);

    let result = pipeline.forward(&red_fox().with_seed(0), &|_: f32, _: &str| {})?;
    assert!(result.seed < 100_000);
    Ok(())
}

struct ThreeSteps;

impl Scheduler for ThreeSteps {
    fn timesteps(&self, _num_steps: usize) -> Vec<i64> {
        vec![900, 500, 100]
    }

    fn step(
        &self,
        latent: Tensor,
        guided_noise: &[f32],
        timestep: i64,
    ) -> pocket_diffusion_common::Result<Tensor> {
        LinearPlaceholderScheduler.step(latent, guided_noise, timestep)
    }
}

#[test]
fn custom_schedulers_drive_the_loop() -> Result<()> {
    let fx = Fixture::new("custom_scheduler");
    fx.manager.ensure_loaded()?;
    let pipeline = Pipeline::new(fx.manager.clone(), true).with_scheduler(Arc::new(ThreeSteps));
    let (events, sink) = recorder();

    pipeline.forward(&red_fox(), &sink)?;
    let events = events.lock().unwrap();
    assert!(events.iter().any(|(_, m)| m == "Denoising: step 3/3"));
    assert!(!events.iter().any(|(_, m)| m == "Denoising: step 4/5"));
    Ok(())
}

/// Answers every forward call with the same tensor.
struct FixedOutput(Tensor);

impl InferenceModule for FixedOutput {
    fn forward(&self, _inputs: ModuleInputs) -> pocket_diffusion_common::Result<Tensor> {
        Ok(self.0.clone())
    }
}

/// Provides only the roles it was built with.
#[derive(Default)]
struct PartialModules(Vec<(Role, FixedOutput)>);

impl PartialModules {
    fn with(mut self, role: Role, output: Tensor) -> Self {
        self.0.push((role, FixedOutput(output)));
        self
    }
}

impl ModuleProvider for PartialModules {
    fn module(&self, role: Role) -> Option<&dyn InferenceModule> {
        self.0
            .iter()
            .find(|(r, _)| *r == role)
            .map(|(_, m)| m as &dyn InferenceModule)
    }
}

fn zero_embeddings() -> Result<GuidanceEmbeddings> {
    let shape = (1, MAX_TOKEN_LENGTH, TEXT_EMBED_DIM);
    Ok(GuidanceEmbeddings::new(
        Tensor::zeros(shape, DType::F32, &Device::Cpu)?,
        Tensor::zeros(shape, DType::F32, &Device::Cpu)?,
    )?)
}

fn latent(value: f32) -> Result<Tensor> {
    Ok(Tensor::full(value, (4, 2, 2), &Device::Cpu)?)
}

#[test]
fn stages_report_the_missing_role() -> Result<()> {
    let none = PartialModules::default();

    let res = EmbeddingEncoder::default().encode(&none, "a red fox", "");
    assert!(matches!(
        res,
        Err(DiffusionError::ModelNotLoaded(Some(Role::TextEncoder)))
    ));

    let engine = DenoisingStepEngine::default();
    let res = engine.step(&none, latent(0.)?, 999, &zero_embeddings()?, 7.5);
    assert!(matches!(
        res,
        Err(DiffusionError::ModelNotLoaded(Some(Role::Denoiser)))
    ));

    let res = LatentDecoder.decode(&none, latent(0.)?, 256);
    assert!(matches!(
        res,
        Err(DiffusionError::ModelNotLoaded(Some(Role::Decoder)))
    ));
    Ok(())
}

#[test]
fn guidance_uses_the_unconditional_half_first() -> Result<()> {
    let dev = Device::Cpu;
    let noise = Tensor::cat(
        &[
            &Tensor::full(1f32, (1, 4, 2, 2), &dev)?,
            &Tensor::full(3f32, (1, 4, 2, 2), &dev)?,
        ],
        0,
    )?;
    let modules = PartialModules::default().with(Role::Denoiser, noise);

    let engine = DenoisingStepEngine::default();
    let out = engine.step(&modules, latent(1.)?, 500, &zero_embeddings()?, 7.5)?;
    assert_eq!(out.dims(), &[4, 2, 2]);
    // guided = 1 + 7.5 * (3 - 1) = 16, x = 1 - 0.02 * 0.5 * 16
    let values = out.flatten_all()?.to_vec1::<f32>()?;
    assert!(values.iter().all(|x| (x - 0.84).abs() < 1e-6), "{values:?}");
    Ok(())
}

#[test]
fn decoded_images_are_resized_to_the_target() -> Result<()> {
    let dev = Device::Cpu;
    let planes = Tensor::cat(
        &[
            &Tensor::full(-1f32, (1, 1, 16, 16), &dev)?,
            &Tensor::full(1f32, (1, 1, 16, 16), &dev)?,
            &Tensor::full(-1f32, (1, 1, 16, 16), &dev)?,
        ],
        1,
    )?;
    let modules = PartialModules::default().with(Role::Decoder, planes);

    let image = LatentDecoder.decode(&modules, latent(0.)?, 32)?.to_rgba8();
    assert_eq!(image.dimensions(), (32, 32));
    assert!(image.pixels().all(|p| p.0 == [0, 255, 0, 255]));
    Ok(())
}

#[test]
fn decoder_planes_are_red_green_blue() -> Result<()> {
    #[rustfmt::skip]
    let data: Vec<f32> = vec![
        -1., 1., -1., 1., // red
        0., 0., 0., 0., // green
        1., 1., -1., -1., // blue
    ];
    let out = Tensor::from_vec(data, (1, 3, 2, 2), &Device::Cpu)?;
    let modules = PartialModules::default().with(Role::Decoder, out);

    let image = LatentDecoder.decode(&modules, latent(0.)?, 2)?.to_rgba8();
    assert_eq!(image.get_pixel(0, 0).0, [0, 128, 255, 255]);
    assert_eq!(image.get_pixel(1, 0).0, [255, 128, 255, 255]);
    assert_eq!(image.get_pixel(0, 1).0, [0, 128, 0, 255]);
    assert_eq!(image.get_pixel(1, 1).0, [255, 128, 0, 255]);
    Ok(())
}

#[test]
fn empty_decoder_output_is_an_error() -> Result<()> {
    let empty = Tensor::zeros((1, 3, 0, 0), DType::F32, &Device::Cpu)?;
    let modules = PartialModules::default().with(Role::Decoder, empty);

    let res = LatentDecoder.decode(&modules, latent(0.)?, 256);
    assert!(matches!(res, Err(DiffusionError::Decode(_))));
    Ok(())
}
