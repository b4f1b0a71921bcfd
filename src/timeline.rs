use std::{
    fs::File,
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
};

use anyhow::Context as _;
use rand::Rng;

use crate::{
    foundation::core::FrameIndex,
    foundation::error::{ReverieError, ReverieResult},
    interp::{InterpMode, interpolate_settings},
    params::{GeneratorSettings, OutputSettings, ParameterSet},
};

/// Generator settings pinned to a frame.
///
/// `interpolation` governs the segment that starts at this key.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Keyframe {
    pub frame: FrameIndex,
    #[serde(default)]
    pub generator: GeneratorSettings,
    #[serde(default)]
    pub interpolation: InterpMode,
}

impl Keyframe {
    pub fn new(frame: u64, generator: GeneratorSettings, interpolation: InterpMode) -> Self {
        Self {
            frame: FrameIndex(frame),
            generator,
            interpolation,
        }
    }

    pub fn linear(frame: u64, generator: GeneratorSettings) -> Self {
        Self::new(frame, generator, InterpMode::Linear)
    }

    pub fn hold(frame: u64, generator: GeneratorSettings) -> Self {
        Self::new(frame, generator, InterpMode::Hold)
    }
}

/// A keyframed animation track plus the output settings shared by all its frames.
///
/// Deserialization runs [`Timeline::validate`], so a timeline that exists is always resolvable.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "TimelineDef")]
pub struct Timeline {
    path: Option<PathBuf>,
    length: u64,         // total frames
    keys: Vec<Keyframe>, // sorted by frame, unique
    output: OutputSettings,
}

#[derive(serde::Deserialize)]
struct TimelineDef {
    #[serde(default)]
    path: Option<PathBuf>,
    length: u64,
    keys: Vec<Keyframe>,
    #[serde(default)]
    output: OutputSettings,
}

impl TryFrom<TimelineDef> for Timeline {
    type Error = ReverieError;

    fn try_from(def: TimelineDef) -> Result<Self, Self::Error> {
        let timeline = Self {
            path: def.path,
            length: def.length,
            keys: def.keys,
            output: def.output,
        };
        timeline.validate()?;
        Ok(timeline)
    }
}

impl Timeline {
    /// Build a timeline. Keys may be given in any order; they are sorted by frame.
    pub fn new(
        length: u64,
        mut keys: Vec<Keyframe>,
        output: OutputSettings,
    ) -> ReverieResult<Self> {
        keys.sort_by_key(|k| k.frame);
        let timeline = Self {
            path: None,
            length,
            keys,
            output,
        };
        timeline.validate()?;
        Ok(timeline)
    }

    /// Single-key timeline holding `generator` for every frame.
    pub fn constant(
        length: u64,
        generator: GeneratorSettings,
        output: OutputSettings,
    ) -> ReverieResult<Self> {
        Self::new(length, vec![Keyframe::linear(0, generator)], output)
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn validate(&self) -> ReverieResult<()> {
        if self.keys.is_empty() {
            return Err(ReverieError::timeline(
                "timeline must have at least one keyframe",
            ));
        }
        if self.length == 0 {
            return Err(ReverieError::validation("timeline length must be > 0 frames"));
        }
        if !self.keys.windows(2).all(|w| w[0].frame < w[1].frame) {
            return Err(ReverieError::timeline(
                "keyframes must be sorted by frame with one key per frame",
            ));
        }
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn set_path(&mut self, path: Option<PathBuf>) {
        self.path = path;
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn set_length(&mut self, length: u64) -> ReverieResult<()> {
        if length == 0 {
            return Err(ReverieError::validation("timeline length must be > 0 frames"));
        }
        self.length = length;
        Ok(())
    }

    pub fn keys(&self) -> &[Keyframe] {
        &self.keys
    }

    pub fn output(&self) -> &OutputSettings {
        &self.output
    }

    pub fn output_mut(&mut self) -> &mut OutputSettings {
        &mut self.output
    }

    pub fn key_at(&self, frame: FrameIndex) -> Option<&Keyframe> {
        self.keys
            .binary_search_by_key(&frame, |k| k.frame)
            .ok()
            .map(|i| &self.keys[i])
    }

    /// Insert `key`, replacing any key already pinned to the same frame.
    pub fn set_key(&mut self, key: Keyframe) {
        match self.keys.binary_search_by_key(&key.frame, |k| k.frame) {
            Ok(i) => self.keys[i] = key,
            Err(i) => self.keys.insert(i, key),
        }
    }

    /// Remove the key at `frame`. The last remaining key cannot be removed.
    pub fn remove_key(&mut self, frame: FrameIndex) -> ReverieResult<Keyframe> {
        let i = self
            .keys
            .binary_search_by_key(&frame, |k| k.frame)
            .map_err(|_| ReverieError::timeline(format!("no keyframe at frame {frame}")))?;
        if self.keys.len() == 1 {
            return Err(ReverieError::timeline(
                "cannot remove the last keyframe of a timeline",
            ));
        }
        Ok(self.keys.remove(i))
    }

    /// Generator settings for `frame`.
    ///
    /// Exact key hits return that key's settings. Frames before the first key hold the first key,
    /// frames after the last key hold the last key. Anything in between is blended with the left
    /// key's interpolation mode.
    pub fn resolve_settings(&self, frame: FrameIndex) -> GeneratorSettings {
        let idx = self.keys.partition_point(|k| k.frame <= frame);

        if idx == 0 {
            return self.keys[0].generator.clone();
        }
        let left = &self.keys[idx - 1];
        if left.frame == frame || idx >= self.keys.len() {
            return left.generator.clone();
        }

        let right = &self.keys[idx];
        let t = ((frame.0 - left.frame.0) as f64) / ((right.frame.0 - left.frame.0) as f64);
        interpolate_settings(&left.generator, &right.generator, t, left.interpolation)
    }

    /// Full parameters for `frame`: resolved generator settings plus the shared output settings.
    pub fn resolve(&self, frame: FrameIndex) -> ParameterSet {
        ParameterSet::new(self.resolve_settings(frame), self.output.clone())
    }

    /// `(frame, params)` for every frame of the timeline, in order.
    pub fn frames(&self) -> impl Iterator<Item = (FrameIndex, ParameterSet)> + '_ {
        (0..self.length).map(|f| (FrameIndex(f), self.resolve(FrameIndex(f))))
    }

    pub fn randomize_seeds<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        for key in &mut self.keys {
            key.generator.randomize_seeds(rng);
        }
    }

    pub fn load_json(path: &Path) -> ReverieResult<Self> {
        let f = File::open(path).with_context(|| format!("open timeline '{}'", path.display()))?;
        let timeline: Timeline = serde_json::from_reader(BufReader::new(f))?;
        Ok(timeline)
    }

    pub fn save_json(&self, path: &Path) -> ReverieResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create timeline dir '{}'", parent.display()))?;
        }
        let f =
            File::create(path).with_context(|| format!("create timeline '{}'", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(f), self)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(prompt: &str, strength: f64, steps: u32) -> GeneratorSettings {
        GeneratorSettings {
            prompt: prompt.to_string(),
            image_strength: strength,
            steps,
            ..GeneratorSettings::default()
        }
    }

    #[test]
    fn empty_keys_are_rejected_at_construction() {
        let err = Timeline::new(10, vec![], OutputSettings::default()).unwrap_err();
        assert!(matches!(err, ReverieError::Timeline(_)));
    }

    #[test]
    fn zero_length_is_rejected() {
        let keys = vec![Keyframe::linear(0, GeneratorSettings::default())];
        assert!(Timeline::new(0, keys, OutputSettings::default()).is_err());
    }

    #[test]
    fn duplicate_frames_are_rejected() {
        let keys = vec![
            Keyframe::linear(3, GeneratorSettings::default()),
            Keyframe::hold(3, GeneratorSettings::default()),
        ];
        assert!(Timeline::new(10, keys, OutputSettings::default()).is_err());
    }

    #[test]
    fn keys_are_sorted_on_construction() {
        let t = Timeline::new(
            10,
            vec![
                Keyframe::linear(8, settings("b", 0.0, 10)),
                Keyframe::linear(2, settings("a", 0.0, 10)),
            ],
            OutputSettings::default(),
        )
        .unwrap();
        let frames: Vec<u64> = t.keys().iter().map(|k| k.frame.0).collect();
        assert_eq!(frames, vec![2, 8]);
    }

    #[test]
    fn clamps_outside_key_span() {
        let a = settings("first", 0.2, 10);
        let b = settings("last", 0.8, 30);
        let t = Timeline::new(
            20,
            vec![Keyframe::linear(4, a.clone()), Keyframe::linear(12, b.clone())],
            OutputSettings::default(),
        )
        .unwrap();
        assert_eq!(t.resolve_settings(FrameIndex(0)), a);
        assert_eq!(t.resolve_settings(FrameIndex(3)), a);
        assert_eq!(t.resolve_settings(FrameIndex(12)), b);
        assert_eq!(t.resolve_settings(FrameIndex(19)), b);
    }

    #[test]
    fn left_key_mode_governs_segment() {
        let a = settings("a", 0.0, 10);
        let b = settings("b", 1.0, 20);
        let c = settings("c", 0.0, 10);
        let t = Timeline::new(
            21,
            vec![
                Keyframe::hold(0, a.clone()),
                Keyframe::linear(10, b.clone()),
                Keyframe::linear(20, c),
            ],
            OutputSettings::default(),
        )
        .unwrap();

        assert_eq!(t.resolve_settings(FrameIndex(5)), a);
        let mid = t.resolve_settings(FrameIndex(15));
        assert_eq!(mid.prompt, "b");
        assert_eq!(mid.image_strength, 0.5);
        assert_eq!(mid.steps, 15);
    }

    #[test]
    fn resolve_is_repeatable() {
        let t = Timeline::new(
            10,
            vec![
                Keyframe::linear(0, settings("a", 0.0, 10)),
                Keyframe::linear(9, settings("b", 0.9, 19)),
            ],
            OutputSettings::default(),
        )
        .unwrap();
        for f in 0..10 {
            assert_eq!(t.resolve(FrameIndex(f)), t.resolve(FrameIndex(f)));
        }
    }

    #[test]
    fn set_and_remove_keys() {
        let mut t =
            Timeline::constant(5, settings("a", 0.0, 10), OutputSettings::default()).unwrap();
        t.set_key(Keyframe::linear(4, settings("b", 0.0, 10)));
        t.set_key(Keyframe::linear(2, settings("c", 0.0, 10)));
        t.set_key(Keyframe::hold(2, settings("d", 0.0, 10)));
        let prompts: Vec<&str> = t.keys().iter().map(|k| k.generator.prompt.as_str()).collect();
        assert_eq!(prompts, vec!["a", "d", "b"]);
        assert!(t.validate().is_ok());

        t.remove_key(FrameIndex(2)).unwrap();
        t.remove_key(FrameIndex(4)).unwrap();
        assert!(t.remove_key(FrameIndex(0)).is_err());
        assert!(t.remove_key(FrameIndex(7)).is_err());
        assert_eq!(t.keys().len(), 1);
    }

    #[test]
    fn deserialization_validates() {
        let bad = r#"{ "length": 4, "keys": [] }"#;
        assert!(serde_json::from_str::<Timeline>(bad).is_err());

        let ok = r#"{ "length": 4, "keys": [ { "frame": 0 } ] }"#;
        let t: Timeline = serde_json::from_str(ok).unwrap();
        assert_eq!(t.length(), 4);
        assert_eq!(t.keys()[0].interpolation, InterpMode::Linear);
    }

    #[test]
    fn randomize_seeds_touches_every_flagged_key() {
        let flagged = GeneratorSettings {
            seed_a_randomize: true,
            seed_a: u32::MAX,
            ..GeneratorSettings::default()
        };
        let mut t = Timeline::new(
            10,
            vec![Keyframe::linear(0, flagged.clone()), Keyframe::linear(5, flagged)],
            OutputSettings::default(),
        )
        .unwrap();
        let mut rng = <rand::rngs::StdRng as rand::SeedableRng>::seed_from_u64(7);
        t.randomize_seeds(&mut rng);
        assert!(t.keys().iter().all(|k| k.generator.seed_a != u32::MAX));
    }
}
