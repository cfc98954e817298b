use crate::capture::{EncodedImage, decode_data_url};
use crate::storage::{self, KEY_GALLERY, SharedStore, ensure_parent_dir};
use crate::stream::now_millis;
use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedFrame {
    pub id: String,
    pub source_name: String,
    /// `data:image/jpeg;base64,...`
    pub image_data: String,
    pub captured_at: DateTime<Utc>,
}

impl CapturedFrame {
    pub fn jpeg_bytes(&self) -> Option<Vec<u8>> {
        decode_data_url(&self.image_data)
    }

    #[must_use]
    pub fn download_file_name(&self) -> String {
        download_file_name(&self.source_name, self.captured_at)
    }
}

/// `Thermal Camera` at 10:00:00Z becomes `thermal-camera-2024-05-01T10-00-00.000Z.jpg`.
#[must_use]
pub fn download_file_name(source_name: &str, captured_at: DateTime<Utc>) -> String {
    let slug = source_name
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-");
    let stamp = captured_at
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace(':', "-");
    format!("{slug}-{stamp}.jpg")
}

/// Captured stills, mirrored to the store after every change.
pub struct Gallery {
    store: SharedStore,
    frames: Vec<CapturedFrame>,
    last_id: u64,
}

impl Gallery {
    pub fn load(store: SharedStore) -> Self {
        let frames: Vec<CapturedFrame> = storage::load_or_default(&*store, KEY_GALLERY);
        let last_id = frames
            .iter()
            .filter_map(|frame| frame.id.parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        Self {
            store,
            frames,
            last_id,
        }
    }

    pub fn frames(&self) -> &[CapturedFrame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&CapturedFrame> {
        self.frames.iter().find(|frame| frame.id == id)
    }

    /// Adds a freshly captured still. Empty captures are not stored.
    pub fn add(&mut self, source_name: &str, image: &EncodedImage) -> Result<Option<CapturedFrame>> {
        if image.is_empty() {
            return Ok(None);
        }
        self.add_at(source_name, image.to_data_url(), Utc::now())
            .map(Some)
    }

    pub fn add_at(
        &mut self,
        source_name: &str,
        image_data: String,
        captured_at: DateTime<Utc>,
    ) -> Result<CapturedFrame> {
        let frame = CapturedFrame {
            id: self.next_id(),
            source_name: source_name.to_owned(),
            image_data,
            captured_at,
        };
        let mut frames = self.frames.clone();
        frames.push(frame.clone());
        self.commit(frames)?;
        info!(id = %frame.id, source = %frame.source_name, "saved frame to gallery");
        Ok(frame)
    }

    pub fn delete(&mut self, id: &str) -> Result<bool> {
        if !self.frames.iter().any(|frame| frame.id == id) {
            return Ok(false);
        }
        let frames = self
            .frames
            .iter()
            .filter(|frame| frame.id != id)
            .cloned()
            .collect();
        self.commit(frames)?;
        Ok(true)
    }

    pub fn clear(&mut self) -> Result<usize> {
        let removed = self.frames.len();
        self.commit(Vec::new())?;
        Ok(removed)
    }

    /// Writes the frame's JPEG into `dir` under its download file name.
    pub fn download(&self, id: &str, dir: &Path) -> Result<PathBuf> {
        let frame = self
            .get(id)
            .ok_or_else(|| anyhow!("no saved frame with id '{id}'"))?;
        write_frame(frame, dir)
    }

    fn next_id(&mut self) -> String {
        // Millisecond ids collide when two captures land in the same tick.
        let id = now_millis().max(self.last_id + 1);
        self.last_id = id;
        id.to_string()
    }

    /// Replaces the in-memory list only once the store accepted it.
    fn commit(&mut self, frames: Vec<CapturedFrame>) -> Result<()> {
        storage::save(&*self.store, KEY_GALLERY, &frames)?;
        self.frames = frames;
        Ok(())
    }
}

pub fn write_frame(frame: &CapturedFrame, dir: &Path) -> Result<PathBuf> {
    let bytes = frame
        .jpeg_bytes()
        .ok_or_else(|| anyhow!("frame '{}' does not hold JPEG data", frame.id))?;
    let path = dir.join(frame.download_file_name());
    ensure_parent_dir(&path)?;
    fs::write(&path, bytes).with_context(|| format!("failed writing {}", path.display()))?;
    Ok(path)
}
