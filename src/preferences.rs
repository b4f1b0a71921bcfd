//! Application preferences, stored as JSON.
//!
//! Every field has a default, so a partial (or empty) file is valid.

use std::{
    fs::File,
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context as _;

use crate::{
    foundation::error::{ReverieError, ReverieResult},
    scheduler::SchedulerOpts,
};

/// Model the backend loads on start.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub config: PathBuf,
    pub weights: PathBuf,
    pub precision: String,
    pub full_precision: bool,
    pub device: String,
}

impl ModelSettings {
    pub fn validate(&self) -> ReverieResult<()> {
        if self.weights.as_os_str().is_empty() {
            return Err(ReverieError::validation("model weights path must not be empty"));
        }
        if self.device.trim().is_empty() {
            return Err(ReverieError::validation("model device must not be empty"));
        }
        Ok(())
    }
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            config: PathBuf::from("configs/stable-diffusion/v1-inference.yaml"),
            weights: PathBuf::from("models/ldm/stable-diffusion-v1/model.ckpt"),
            precision: "autocast".to_string(),
            full_precision: true,
            device: "cuda".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Preferences {
    pub library_path: PathBuf,
    pub model: ModelSettings,
    /// How long the idle worker waits on the queue before re-checking for a stop request.
    pub poll_interval_ms: u64,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            library_path: PathBuf::from("library"),
            model: ModelSettings::default(),
            poll_interval_ms: 250,
        }
    }
}

impl Preferences {
    pub fn validate(&self) -> ReverieResult<()> {
        if self.library_path.as_os_str().is_empty() {
            return Err(ReverieError::validation("library_path must not be empty"));
        }
        if self.poll_interval_ms == 0 {
            return Err(ReverieError::validation("poll_interval_ms must be > 0"));
        }
        self.model.validate()
    }

    pub fn load(path: &Path) -> ReverieResult<Self> {
        let f =
            File::open(path).with_context(|| format!("open preferences '{}'", path.display()))?;
        let prefs: Preferences = serde_json::from_reader(BufReader::new(f))?;
        prefs.validate()?;
        Ok(prefs)
    }

    /// Load `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> ReverieResult<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "no preferences file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> ReverieResult<()> {
        crate::library::ensure_parent_dir(path)?;
        let f = File::create(path)
            .with_context(|| format!("create preferences '{}'", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(f), self)?;
        Ok(())
    }

    pub fn scheduler_opts(&self) -> SchedulerOpts {
        SchedulerOpts {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            ..SchedulerOpts::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_uses_defaults() {
        let prefs: Preferences =
            serde_json::from_str(r#"{ "library_path": "out", "model": { "device": "cpu" } }"#)
                .unwrap();
        assert_eq!(prefs.library_path, PathBuf::from("out"));
        assert_eq!(prefs.model.device, "cpu");
        assert_eq!(prefs.model.precision, "autocast");
        assert_eq!(prefs.poll_interval_ms, 250);
        prefs.validate().unwrap();
    }

    #[test]
    fn zero_poll_interval_is_invalid() {
        let prefs = Preferences {
            poll_interval_ms: 0,
            ..Preferences::default()
        };
        assert!(prefs.validate().is_err());
    }

    #[test]
    fn empty_model_device_is_invalid() {
        let prefs: Preferences =
            serde_json::from_str(r#"{ "model": { "device": " " } }"#).unwrap();
        assert!(prefs.validate().is_err());
    }

    #[test]
    fn scheduler_opts_follow_poll_interval() {
        let prefs = Preferences {
            poll_interval_ms: 40,
            ..Preferences::default()
        };
        assert_eq!(prefs.scheduler_opts().poll_interval, Duration::from_millis(40));
    }

    #[test]
    fn save_then_load() {
        let path = std::env::temp_dir().join(format!(
            "reverie_prefs_{}_{}.json",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        let prefs = Preferences {
            poll_interval_ms: 100,
            ..Preferences::default()
        };
        prefs.save(&path).unwrap();
        assert_eq!(Preferences::load(&path).unwrap(), prefs);
        assert_eq!(Preferences::load_or_default(&path).unwrap(), prefs);
        std::fs::remove_file(&path).ok();
        assert_eq!(
            Preferences::load_or_default(&path).unwrap(),
            Preferences::default()
        );
    }
}
