//! The generation backend seam.
//!
//! A backend is non-reentrant shared state. The scheduler moves it onto its worker thread and
//! never calls it from anywhere else, which is why the trait only requires `Send`.

pub mod preview;

use image::DynamicImage;

use crate::{foundation::error::ReverieResult, params::ParameterSet};

/// One denoising step reported by the backend while a frame is generated.
#[derive(Clone, Copy, Debug)]
pub struct StepState<'a> {
    /// 0-based step index.
    pub step: u32,
    /// Intermediate latent state, when the backend exposes it.
    pub latents: Option<&'a [f32]>,
}

/// Images produced by one generation call.
#[derive(Clone, Debug)]
pub struct Generated {
    /// Image after optional upscale and face restoration.
    pub final_image: DynamicImage,
    /// Sampler output before post-processing. `None` when no post-processing ran.
    pub raw_image: Option<DynamicImage>,
}

impl Generated {
    pub fn single(image: DynamicImage) -> Self {
        Self {
            final_image: image,
            raw_image: None,
        }
    }
}

pub trait GenerationBackend: Send {
    /// Load model weights. Called once on the worker thread before any generation; may block for a
    /// long time.
    fn load(&mut self) -> ReverieResult<()>;

    /// Generate one image.
    ///
    /// `params` is already normalized. `on_step` must be called synchronously on the calling thread,
    /// once per internal step, in increasing step order.
    fn generate(
        &mut self,
        params: &ParameterSet,
        on_step: &mut dyn FnMut(StepState<'_>),
    ) -> ReverieResult<Generated>;
}

impl<B: GenerationBackend + ?Sized> GenerationBackend for Box<B> {
    fn load(&mut self) -> ReverieResult<()> {
        (**self).load()
    }

    fn generate(
        &mut self,
        params: &ParameterSet,
        on_step: &mut dyn FnMut(StepState<'_>),
    ) -> ReverieResult<Generated> {
        (**self).generate(params, on_step)
    }
}
