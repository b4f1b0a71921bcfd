//! Artifact persistence.
//!
//! Every generated image is written next to a JSON sidecar holding the exact [`ParameterSet`] that
//! produced it. The sidecar is the reproducibility record of a frame, so its schema is versioned
//! and checked on load.

use std::{
    fs::File,
    io::{BufReader, BufWriter},
    path::{Path, PathBuf},
};

use anyhow::Context as _;
use image::DynamicImage;

use crate::{
    foundation::core::FrameIndex,
    foundation::error::{ReverieError, ReverieResult},
    output,
    params::{OutputFormat, ParameterSet},
};

pub const METADATA_VERSION: u32 = 1;

/// Sidecar written next to every generated image.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FrameMetadata {
    pub version: u32,
    /// Image path relative to the library.
    pub path: PathBuf,
    /// Frame index inside its sequence, `None` for single images.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame: Option<FrameIndex>,
    pub params: ParameterSet,
}

impl FrameMetadata {
    pub fn new(path: impl Into<PathBuf>, frame: Option<FrameIndex>, params: ParameterSet) -> Self {
        Self {
            version: METADATA_VERSION,
            path: path.into(),
            frame,
            params,
        }
    }

    pub fn to_json(&self) -> ReverieResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(s: &str) -> ReverieResult<Self> {
        let meta: FrameMetadata = serde_json::from_str(s)?;
        meta.check_version()?;
        Ok(meta)
    }

    fn check_version(&self) -> ReverieResult<()> {
        if self.version != METADATA_VERSION {
            return Err(ReverieError::serde(format!(
                "unsupported metadata version {} (expected {METADATA_VERSION})",
                self.version
            )));
        }
        Ok(())
    }
}

/// Where generated artifacts are stored.
///
/// Implementations are moved onto the scheduler's worker thread.
pub trait Library: Send {
    /// Absolute path for a library-relative path, with optional suffix and extension override
    /// (see [`output::compose_path`]).
    fn compose_path(
        &self,
        relative: &Path,
        suffix: Option<&str>,
        extension: Option<&str>,
    ) -> PathBuf;

    fn save_image(&self, image: &DynamicImage, path: &Path) -> ReverieResult<()>;

    fn save_metadata(&self, metadata: &FrameMetadata, path: &Path) -> ReverieResult<()> {
        ensure_parent_dir(path)?;
        let f = File::create(path)
            .with_context(|| format!("create metadata '{}'", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(f), metadata)?;
        Ok(())
    }
}

/// Library rooted at a directory on disk.
#[derive(Clone, Debug)]
pub struct FsLibrary {
    base_path: PathBuf,
    folder: PathBuf,
}

impl FsLibrary {
    /// Open (and create) a library rooted at `base_path`.
    pub fn open(base_path: impl Into<PathBuf>) -> ReverieResult<Self> {
        let base_path = base_path.into();
        std::fs::create_dir_all(&base_path)
            .with_context(|| format!("create library dir '{}'", base_path.display()))?;
        Ok(Self {
            base_path,
            folder: PathBuf::new(),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Sub-folder new artifacts are written to.
    pub fn set_folder(&mut self, folder: impl Into<PathBuf>) {
        self.folder = folder.into();
    }

    pub fn load_image(&self, path: &Path) -> ReverieResult<DynamicImage> {
        let img = image::open(path).with_context(|| format!("open image '{}'", path.display()))?;
        Ok(img)
    }

    pub fn load_metadata(&self, path: &Path) -> ReverieResult<FrameMetadata> {
        let f = File::open(path).with_context(|| format!("open metadata '{}'", path.display()))?;
        let meta: FrameMetadata = serde_json::from_reader(BufReader::new(f))?;
        meta.check_version()?;
        Ok(meta)
    }
}

impl Library for FsLibrary {
    fn compose_path(
        &self,
        relative: &Path,
        suffix: Option<&str>,
        extension: Option<&str>,
    ) -> PathBuf {
        let relative = output::compose_path(relative, suffix, extension);
        self.base_path.join(&self.folder).join(relative)
    }

    fn save_image(&self, image: &DynamicImage, path: &Path) -> ReverieResult<()> {
        let format = path
            .extension()
            .and_then(|e| OutputFormat::from_extension(&e.to_string_lossy()))
            .ok_or_else(|| {
                ReverieError::persistence(format!(
                    "unsupported image extension for '{}'",
                    path.display()
                ))
            })?;
        ensure_parent_dir(path)?;

        // Jpeg and bmp encoders reject alpha.
        let rgb;
        let image = if format == OutputFormat::Png || !image.color().has_alpha() {
            image
        } else {
            rgb = DynamicImage::ImageRgb8(image.to_rgb8());
            &rgb
        };

        image
            .save_with_format(path, format.image_format())
            .with_context(|| format!("write image '{}'", path.display()))?;
        Ok(())
    }
}

pub fn ensure_parent_dir(path: &Path) -> ReverieResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create output directory '{}'", parent.display()))?;
    }
    Ok(())
}
