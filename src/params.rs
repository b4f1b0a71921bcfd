//! Generation parameters.
//!
//! A [`ParameterSet`] is everything one backend call needs. It is split in two halves:
//!
//! - [`GeneratorSettings`]: the content knobs a keyframe pins (prompt, seeds, sampling).
//! - [`OutputSettings`]: raster geometry and post-processing, shared by every frame of a
//!   timeline.
//!
//! Values are not range-checked while they are being edited. [`ParameterSet::normalized`] is the
//! single place where a set is made safe for the backend.

use std::path::{Path, PathBuf};

use rand::Rng;

/// Upper bound for `image_strength` whenever it reaches the backend.
pub const MAX_IMAGE_STRENGTH: f64 = 0.99;

/// Backend geometry granularity in pixels.
pub const SIZE_MULTIPLE: u32 = 64;

const MIN_CFG_SCALE: f64 = 0.1;
const SEED_MAX: u32 = i32::MAX as u32;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Sampler {
    #[default]
    #[serde(rename = "plms")]
    Plms,
    #[serde(rename = "ddim")]
    Ddim,
    #[serde(rename = "k_dpm_2")]
    KDpm2,
    #[serde(rename = "k_dpm_2_a")]
    KDpm2Ancestral,
    #[serde(rename = "k_euler")]
    KEuler,
    #[serde(rename = "k_euler_a")]
    KEulerAncestral,
    #[serde(rename = "k_heun")]
    KHeun,
    #[serde(rename = "k_lms")]
    KLms,
}

impl Sampler {
    pub const ALL: [Sampler; 8] = [
        Sampler::Plms,
        Sampler::Ddim,
        Sampler::KDpm2,
        Sampler::KDpm2Ancestral,
        Sampler::KEuler,
        Sampler::KEulerAncestral,
        Sampler::KHeun,
        Sampler::KLms,
    ];

    /// Identifier understood by the backend.
    pub fn id(self) -> &'static str {
        match self {
            Self::Plms => "plms",
            Self::Ddim => "ddim",
            Self::KDpm2 => "k_dpm_2",
            Self::KDpm2Ancestral => "k_dpm_2_a",
            Self::KEuler => "k_euler",
            Self::KEulerAncestral => "k_euler_a",
            Self::KHeun => "k_heun",
            Self::KLms => "k_lms",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Plms => "PLMS",
            Self::Ddim => "DDIM",
            Self::KDpm2 => "K DPM2",
            Self::KDpm2Ancestral => "K DPM2 Ancestral",
            Self::KEuler => "K Euler",
            Self::KEulerAncestral => "K Euler Ancestral",
            Self::KHeun => "K Heun",
            Self::KLms => "K LMS",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.id() == id)
    }

    /// Whether the sampler consumes `ddim_eta`.
    pub fn uses_eta(self) -> bool {
        matches!(self, Self::Ddim)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Png,
    #[serde(rename = "jpg")]
    Jpeg,
    Bmp,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
            Self::Bmp => "bmp",
        }
    }

    pub fn image_format(self) -> image::ImageFormat {
        match self {
            Self::Png => image::ImageFormat::Png,
            Self::Jpeg => image::ImageFormat::Jpeg,
            Self::Bmp => image::ImageFormat::Bmp,
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "png" => Some(Self::Png),
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "bmp" => Some(Self::Bmp),
            _ => None,
        }
    }
}

/// Upscale factor applied after generation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Upscale {
    #[default]
    X1,
    X2,
    X4,
}

impl Upscale {
    pub fn factor(self) -> u32 {
        match self {
            Self::X1 => 1,
            Self::X2 => 2,
            Self::X4 => 4,
        }
    }
}

impl TryFrom<u32> for Upscale {
    type Error = String;

    fn try_from(v: u32) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Self::X1),
            2 => Ok(Self::X2),
            4 => Ok(Self::X4),
            other => Err(format!("upscale factor must be 1, 2 or 4 (got {other})")),
        }
    }
}

impl From<Upscale> for u32 {
    fn from(u: Upscale) -> Self {
        u.factor()
    }
}

/// Content knobs pinned by keyframes.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct GeneratorSettings {
    pub prompt: String,
    pub negative_prompt: String,

    pub image_path: Option<PathBuf>,
    pub mask_path: Option<PathBuf>,
    pub image_strength: f64,    // 0..1
    pub feedback_strength: f64, // 0..1

    pub seed_a: u32,
    pub seed_a_randomize: bool,
    pub seed_b: u32,
    pub seed_b_randomize: bool,
    pub seed_blend: f64, // 0..1, weight of seed_b
    pub steps: u32,
    pub cfg_scale: f64,
    pub sampler: Sampler,
    pub ddim_eta: f64, // ddim only
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            prompt: "An astronaut riding on a horse in the desert, trending on artstation"
                .to_string(),
            negative_prompt: String::new(),
            image_path: None,
            mask_path: None,
            image_strength: 0.0,
            feedback_strength: 0.0,
            seed_a: 5_946_931,
            seed_a_randomize: false,
            seed_b: 7_192_209,
            seed_b_randomize: false,
            seed_blend: 0.0,
            steps: 50,
            cfg_scale: 7.5,
            sampler: Sampler::Plms,
            ddim_eta: 0.0,
        }
    }
}

impl GeneratorSettings {
    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    /// Replace every seed whose randomize flag is set.
    pub fn randomize_seeds<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        if self.seed_a_randomize {
            self.seed_a = rng.random_range(0..SEED_MAX);
        }
        if self.seed_b_randomize {
            self.seed_b = rng.random_range(0..SEED_MAX);
        }
    }

    /// Input image path, treating an empty path as absent.
    pub fn input_image(&self) -> Option<&Path> {
        non_empty(self.image_path.as_deref())
    }

    pub fn input_mask(&self) -> Option<&Path> {
        non_empty(self.mask_path.as_deref())
    }
}

/// Raster geometry and post-processing shared by all frames of a timeline.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    pub format: OutputFormat,
    pub width: u32,
    pub height: u32,
    pub seamless: bool,
    pub upscale: Upscale,
    pub upscale_strength: f64, // 0..1
    pub face_strength: f64,    // 0..1, face restoration
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            format: OutputFormat::Png,
            width: 512,
            height: 512,
            seamless: false,
            upscale: Upscale::X1,
            upscale_strength: 0.75,
            face_strength: 0.0,
        }
    }
}

impl OutputSettings {
    /// Whether the backend must run the upscale/face-restoration pass.
    pub fn wants_post_processing(&self) -> bool {
        self.upscale != Upscale::X1 || self.face_strength > 0.0
    }
}

/// Full parameters of a single generation call.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ParameterSet {
    pub generator: GeneratorSettings,
    pub output: OutputSettings,
}

impl ParameterSet {
    pub fn new(generator: GeneratorSettings, output: OutputSettings) -> Self {
        Self { generator, output }
    }

    pub fn randomize_seeds<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.generator.randomize_seeds(rng);
    }

    /// Backend-safe copy of this set.
    ///
    /// Clamps every documented range, snaps geometry to [`SIZE_MULTIPLE`], drops `ddim_eta` for
    /// samplers that ignore it and, when `image_strength >= 1.0`, clears the input image and
    /// lowers the strength to [`MAX_IMAGE_STRENGTH`]. The backend cannot run at full strength
    /// with an input image attached.
    pub fn normalized(&self) -> ParameterSet {
        let mut p = self.clone();
        let g = &mut p.generator;

        g.image_path = g.input_image().map(Path::to_path_buf);
        g.mask_path = g.input_mask().map(Path::to_path_buf);

        if g.image_strength >= 1.0 {
            g.image_path = None;
            g.image_strength = MAX_IMAGE_STRENGTH;
        }
        g.image_strength = unit(g.image_strength);
        g.feedback_strength = unit(g.feedback_strength);
        g.seed_blend = unit(g.seed_blend);
        g.steps = g.steps.max(1);
        g.cfg_scale = if g.cfg_scale.is_finite() {
            g.cfg_scale.max(MIN_CFG_SCALE)
        } else {
            MIN_CFG_SCALE
        };
        if !g.sampler.uses_eta() || !g.ddim_eta.is_finite() {
            g.ddim_eta = 0.0;
        }

        let o = &mut p.output;
        o.width = snap_size(o.width);
        o.height = snap_size(o.height);
        o.upscale_strength = unit(o.upscale_strength);
        o.face_strength = unit(o.face_strength);

        p
    }
}

fn non_empty(path: Option<&Path>) -> Option<&Path> {
    path.filter(|p| !p.as_os_str().is_empty())
}

fn unit(v: f64) -> f64 {
    if v.is_nan() { 0.0 } else { v.clamp(0.0, 1.0) }
}

fn snap_size(v: u32) -> u32 {
    (v / SIZE_MULTIPLE).max(1) * SIZE_MULTIPLE
}
