//! Output file naming.

use std::path::{Path, PathBuf};

use crate::{foundation::core::FrameIndex, params::OutputFormat};

/// Minimum digits of the frame number in sequence file names.
pub const FRAME_DIGITS: usize = 4;

/// Insert `suffix` before the extension and/or replace the extension.
///
/// `compose_path("a/b.png", Some(".raw"), None)` is `a/b.raw.png`;
/// `compose_path("a/b.png", None, Some("json"))` is `a/b.json`.
pub fn compose_path(path: &Path, suffix: Option<&str>, extension: Option<&str>) -> PathBuf {
    if suffix.is_none() && extension.is_none() {
        return path.to_path_buf();
    }

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = match extension {
        Some(e) => Some(e.trim_start_matches('.').to_string()),
        None => path.extension().map(|e| e.to_string_lossy().into_owned()),
    };

    let mut name = stem;
    if let Some(s) = suffix {
        name.push_str(s);
    }
    if let Some(e) = ext
        && !e.is_empty()
    {
        name.push('.');
        name.push_str(&e);
    }
    path.with_file_name(name)
}

/// `base` with its extension set to the format's when it has none.
pub fn with_format_extension(base: &Path, format: OutputFormat) -> PathBuf {
    if base.extension().is_some() {
        base.to_path_buf()
    } else {
        base.with_extension(format.extension())
    }
}

/// File name of one frame of a sequence: `name-0007.png`.
pub fn frame_file_name(base: &Path, frame: FrameIndex) -> PathBuf {
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut name = format!("{stem}-{:0width$}", frame.0, width = FRAME_DIGITS);
    if let Some(ext) = base.extension() {
        name.push('.');
        name.push_str(&ext.to_string_lossy());
    }
    base.with_file_name(name)
}

/// Derives output names for jobs submitted without a path.
///
/// Names are local timestamps with microsecond resolution. A name equal to the previous one gets a
/// counter suffix, so rapid submissions never overwrite each other.
#[derive(Debug, Default)]
pub struct OutputNamer {
    last: Option<String>,
    repeat: u32,
}

impl OutputNamer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_path(&mut self, format: OutputFormat) -> PathBuf {
        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S-%6f").to_string();
        self.name_for(stamp, format)
    }

    fn name_for(&mut self, stamp: String, format: OutputFormat) -> PathBuf {
        let name = if self.last.as_deref() == Some(stamp.as_str()) {
            self.repeat += 1;
            format!("{stamp}-{}", self.repeat)
        } else {
            self.repeat = 0;
            stamp.clone()
        };
        self.last = Some(stamp);
        PathBuf::from(name).with_extension(format.extension())
    }
}
