use std::fs::OpenOptions;
use std::io::{self, Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use image::{DynamicImage, ImageFormat};
use tracing::debug;

use crate::error::{LifecycleError, Result};

/// Shared across sinks so two sinks on the same directory never race.
static SEQUENCE: AtomicU64 = AtomicU64::new(0);

const MAX_ATTEMPTS: usize = 16;

/// A PNG written by [`ImageSink::save`].
#[derive(Debug, Clone)]
pub struct SavedImage {
    pub filename: String,
    pub path: PathBuf,
    pub png: Vec<u8>,
}

/// Writes generated images as uniquely named PNG files.
#[derive(Debug, Clone)]
pub struct ImageSink {
    dir: PathBuf,
}

impl ImageSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Names are `YYYYmmdd_HHMMSS_<seq>.png`. Files are created with
    /// `create_new`, so an existing file is never overwritten.
    pub fn save(&self, image: &DynamicImage) -> Result<SavedImage> {
        let mut png = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .map_err(|e| LifecycleError::PersistFailed(format!("png encoding failed: {e}")))?;

        std::fs::create_dir_all(&self.dir)
            .map_err(|e| LifecycleError::PersistFailed(format!("{}: {e}", self.dir.display())))?;

        for _ in 0..MAX_ATTEMPTS {
            let filename = next_filename();
            let path = self.dir.join(&filename);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(&png)
                        .and_then(|()| file.sync_all())
                        .map_err(|e| LifecycleError::PersistFailed(format!("{}: {e}", path.display())))?;
                    debug!(path = %path.display(), bytes = png.len(), "image saved");
                    return Ok(SavedImage { filename, path, png });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(LifecycleError::PersistFailed(format!("{}: {e}", path.display())));
                }
            }
        }
        Err(LifecycleError::PersistFailed(
            "could not find a free output file name".to_string(),
        ))
    }
}

fn next_filename() -> String {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("{stamp}_{seq:04}.png")
}

/// True for a bare file name that cannot escape the output directory.
pub fn is_safe_filename(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}
