use crate::params::{GeneratorSettings, OutputSettings, ParameterSet};

pub trait Lerp: Sized {
    fn lerp(a: &Self, b: &Self, t: f64) -> Self;
}

impl Lerp for f64 {
    fn lerp(a: &Self, b: &Self, t: f64) -> Self {
        a + (b - a) * t
    }
}

impl Lerp for u32 {
    // Lerped in f64 then truncated toward zero.
    fn lerp(a: &Self, b: &Self, t: f64) -> Self {
        <f64 as Lerp>::lerp(&f64::from(*a), &f64::from(*b), t).trunc() as u32
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterpMode {
    #[default]
    Linear,
    Hold,
}

/// Blend two generator settings.
///
/// Only the numeric intensity knobs move. Text, sampler, paths, randomize flags and both seeds
/// come from `a`; cross-fading between seeds happens through `seed_blend`.
///
/// `factor` is expected in `[0, 1]` and is not checked.
pub fn interpolate_settings(
    a: &GeneratorSettings,
    b: &GeneratorSettings,
    factor: f64,
    mode: InterpMode,
) -> GeneratorSettings {
    match mode {
        InterpMode::Hold => a.clone(),
        InterpMode::Linear => GeneratorSettings::lerp(a, b, factor),
    }
}

/// Blend two full parameter sets; see [`interpolate_settings`].
pub fn interpolate(
    a: &ParameterSet,
    b: &ParameterSet,
    factor: f64,
    mode: InterpMode,
) -> ParameterSet {
    match mode {
        InterpMode::Hold => a.clone(),
        InterpMode::Linear => ParameterSet::lerp(a, b, factor),
    }
}

impl Lerp for GeneratorSettings {
    fn lerp(a: &Self, b: &Self, t: f64) -> Self {
        Self {
            prompt: a.prompt.clone(),
            negative_prompt: a.negative_prompt.clone(),

            image_path: a.image_path.clone(),
            mask_path: a.mask_path.clone(),
            image_strength: <f64 as Lerp>::lerp(&a.image_strength, &b.image_strength, t),
            feedback_strength: <f64 as Lerp>::lerp(&a.feedback_strength, &b.feedback_strength, t),

            seed_a: a.seed_a,
            seed_a_randomize: a.seed_a_randomize,
            seed_b: a.seed_b,
            seed_b_randomize: a.seed_b_randomize,
            seed_blend: <f64 as Lerp>::lerp(&a.seed_blend, &b.seed_blend, t),
            steps: <u32 as Lerp>::lerp(&a.steps, &b.steps, t),
            cfg_scale: <f64 as Lerp>::lerp(&a.cfg_scale, &b.cfg_scale, t),
            sampler: a.sampler,
            ddim_eta: <f64 as Lerp>::lerp(&a.ddim_eta, &b.ddim_eta, t),
        }
    }
}

impl Lerp for OutputSettings {
    // Geometry and format are discrete; only the post-processing strengths blend.
    fn lerp(a: &Self, b: &Self, t: f64) -> Self {
        Self {
            upscale_strength: <f64 as Lerp>::lerp(&a.upscale_strength, &b.upscale_strength, t),
            face_strength: <f64 as Lerp>::lerp(&a.face_strength, &b.face_strength, t),
            ..a.clone()
        }
    }
}

impl Lerp for ParameterSet {
    fn lerp(a: &Self, b: &Self, t: f64) -> Self {
        Self {
            generator: GeneratorSettings::lerp(&a.generator, &b.generator, t),
            output: OutputSettings::lerp(&a.output, &b.output, t),
        }
    }
}
