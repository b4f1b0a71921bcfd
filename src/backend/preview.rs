use image::{DynamicImage, RgbImage, imageops::FilterType};

use crate::{
    backend::{GenerationBackend, Generated, StepState},
    foundation::error::{ReverieError, ReverieResult},
    params::ParameterSet,
    preferences::ModelSettings,
};

/// Deterministic CPU stand-in for a diffusion model.
///
/// Paints a gradient whose colors derive from the seeds, the seed blend and the prompt, and reports
/// every step. Used for dry runs of timelines and in tests; it never touches a GPU.
#[derive(Debug, Default)]
pub struct PreviewBackend {
    model: ModelSettings,
    loaded: bool,
    latents: Vec<f32>,
}

impl PreviewBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend standing in for `model`. The settings are checked on `load` and reported in logs.
    pub fn from_model(model: &ModelSettings) -> Self {
        Self {
            model: model.clone(),
            ..Self::default()
        }
    }

    pub fn model(&self) -> &ModelSettings {
        &self.model
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }
}

impl GenerationBackend for PreviewBackend {
    fn load(&mut self) -> ReverieResult<()> {
        self.model.validate()?;
        tracing::info!(
            weights = %self.model.weights.display(),
            device = %self.model.device,
            precision = %self.model.precision,
            "preview backend loaded"
        );
        self.loaded = true;
        Ok(())
    }

    fn generate(
        &mut self,
        params: &ParameterSet,
        on_step: &mut dyn FnMut(StepState<'_>),
    ) -> ReverieResult<Generated> {
        if !self.loaded {
            return Err(ReverieError::backend("preview backend used before load()"));
        }

        let g = &params.generator;
        let out = &params.output;
        if out.width == 0 || out.height == 0 {
            return Err(ReverieError::backend("output width/height must be non-zero"));
        }

        let a = palette(u64::from(g.seed_a));
        let b = palette(u64::from(g.seed_b));
        let tint = palette(fnv1a(g.prompt.as_bytes()));
        let base: [f64; 3] =
            std::array::from_fn(|i| (a[i] + (b[i] - a[i]) * g.seed_blend) * 0.8 + tint[i] * 0.2);

        self.latents.clear();
        self.latents.extend(base.iter().map(|v| *v as f32));
        for step in 0..g.steps {
            let k = (step + 1) as f32 / g.steps.max(1) as f32;
            for v in &mut self.latents {
                *v *= 0.5 + 0.5 * k;
            }
            on_step(StepState {
                step,
                latents: Some(&self.latents),
            });
        }

        let (w, h) = (out.width, out.height);
        let raw = RgbImage::from_fn(w, h, |x, y| {
            let fx = f64::from(x) / f64::from(w.max(2) - 1);
            let fy = f64::from(y) / f64::from(h.max(2) - 1);
            let shade = 0.6 + 0.4 * (1.0 - (fx + fy) * 0.5);
            image::Rgb(base.map(|c| (c * shade * 255.0).round().clamp(0.0, 255.0) as u8))
        });
        let raw = DynamicImage::ImageRgb8(raw);

        if !out.wants_post_processing() {
            return Ok(Generated::single(raw));
        }

        let factor = out.upscale.factor();
        let final_image = raw.resize_exact(w * factor, h * factor, FilterType::Triangle);
        Ok(Generated {
            final_image,
            raw_image: Some(raw),
        })
    }
}

fn palette(seed: u64) -> [f64; 3] {
    // splitmix64
    let mut z = seed.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^= z >> 31;
    [
        f64::from((z & 0xff) as u8) / 255.0,
        f64::from(((z >> 8) & 0xff) as u8) / 255.0,
        f64::from(((z >> 16) & 0xff) as u8) / 255.0,
    ]
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |h, b| {
        (h ^ u64::from(*b)).wrapping_mul(0x0000_0100_0000_01b3)
    })
}
