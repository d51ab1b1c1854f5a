//! Media storage for uploaded and downloaded WhatsApp attachments
//!
//! Files live under `MEDIA_ROOT` and are addressed by URLs under `MEDIA_URL`.
//! Voice notes recorded by browsers (WebM) are transcoded to OGG/Opus with
//! `ffmpeg` before being handed to WhatsApp.

use std::path::{Component, Path, PathBuf};

use tokio::fs;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Maximum upload size (WhatsApp media limit for most types)
pub const MAX_UPLOAD_SIZE: usize = 16 * 1024 * 1024;

const UPLOAD_DIR: &str = "whatsapp/uploads";
const INCOMING_DIR: &str = "whatsapp/incoming";

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("File too large: {size} bytes (max: {max})")]
    TooLarge { size: usize, max: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A stored file and the URL it is served under
#[derive(Debug, Clone)]
pub struct SavedMedia {
    pub url: String,
    pub filename: String,
    pub path: PathBuf,
}

/// Media directory manager
#[derive(Debug, Clone)]
pub struct MediaStore {
    root: PathBuf,
    url_prefix: String,
}

impl MediaStore {
    pub fn new(root: impl Into<PathBuf>, url_prefix: &str) -> Self {
        let mut url_prefix = url_prefix.to_string();
        if !url_prefix.ends_with('/') {
            url_prefix.push('/');
        }
        Self {
            root: root.into(),
            url_prefix,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn url_prefix(&self) -> &str {
        &self.url_prefix
    }

    fn url_for(&self, relative: &str) -> String {
        format!("{}{}", self.url_prefix, relative)
    }

    async fn write(&self, relative: &str, data: &[u8]) -> Result<PathBuf, MediaError> {
        let path = self.root.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, data).await?;
        debug!("Saved media {:?} ({} bytes)", path, data.len());
        Ok(path)
    }

    /// Store a user upload under a fresh name, keeping the original extension
    pub async fn save_upload(
        &self,
        original_name: &str,
        data: &[u8],
    ) -> Result<SavedMedia, MediaError> {
        if data.len() > MAX_UPLOAD_SIZE {
            return Err(MediaError::TooLarge {
                size: data.len(),
                max: MAX_UPLOAD_SIZE,
            });
        }

        let extension = Path::new(original_name)
            .extension()
            .and_then(|e| e.to_str())
            .filter(|e| e.chars().all(|c| c.is_ascii_alphanumeric()))
            .map(|e| format!(".{}", e.to_ascii_lowercase()))
            .unwrap_or_default();
        let filename = format!("{}{}", uuid::Uuid::new_v4().simple(), extension);
        let relative = format!("{}/{}", UPLOAD_DIR, filename);

        let path = self.write(&relative, data).await?;
        Ok(SavedMedia {
            url: self.url_for(&relative),
            filename,
            path,
        })
    }

    /// Store media downloaded from WhatsApp; returns its URL
    pub async fn save_incoming(
        &self,
        media_id: &str,
        mime_type: Option<&str>,
        data: &[u8],
    ) -> Result<String, MediaError> {
        let safe_id: String = media_id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
            .collect();
        let relative = format!(
            "{}/{}.{}",
            INCOMING_DIR,
            safe_id,
            extension_for_mime(mime_type.unwrap_or_default())
        );

        self.write(&relative, data).await?;
        Ok(self.url_for(&relative))
    }

    /// Filesystem path for a media reference.
    ///
    /// Accepts a `MEDIA_URL`-prefixed URL, a path relative to the root, or
    /// an absolute path.
    pub fn resolve(&self, media_ref: &str) -> PathBuf {
        if let Some(relative) = media_ref.strip_prefix(&self.url_prefix) {
            return self.root.join(relative);
        }
        let path = Path::new(media_ref);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    /// Delete the file behind a stored media URL; returns whether one was removed
    pub async fn remove_url(&self, url: &str) -> bool {
        let mut relative = url.trim_start_matches('/');
        let prefix = self.url_prefix.trim_matches('/');
        if !prefix.is_empty()
            && let Some(rest) = relative.strip_prefix(prefix)
            && rest.starts_with('/')
        {
            relative = rest.trim_start_matches('/');
        }

        let relative = Path::new(relative);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            warn!("Refusing to delete media outside the media root: {}", url);
            return false;
        }

        let path = self.root.join(relative);
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Deleted media file {:?}", path);
                true
            }
            Err(_) => false,
        }
    }

    /// Transcode WebM media to OGG/Opus for WhatsApp.
    ///
    /// Returns the new reference in the same form as the input (URL,
    /// relative or absolute), or the input unchanged when no conversion was
    /// needed or it failed.
    pub async fn convert_for_whatsapp(&self, media_ref: &str) -> String {
        let full_path = self.resolve(media_ref);

        if !full_path.exists() {
            warn!(
                "Media file not found for conversion: {:?} (ref: {})",
                full_path, media_ref
            );
            return media_ref.to_string();
        }
        if !is_webm(&full_path) {
            return media_ref.to_string();
        }

        let output_path = full_path.with_extension("ogg");
        info!("Converting WebM media to OGG for WhatsApp: {:?}", full_path);

        let result = Command::new("ffmpeg")
            .arg("-i")
            .arg(&full_path)
            .args(["-c:a", "libopus", "-b:a", "32k", "-vn", "-y"])
            .arg(&output_path)
            .output()
            .await;

        match result {
            Ok(output) if output.status.success() && output_path.exists() => {
                info!("Conversion successful: {:?}", output_path);
                Path::new(media_ref)
                    .with_extension("ogg")
                    .to_string_lossy()
                    .into_owned()
            }
            Ok(output) => {
                error!(
                    "ffmpeg conversion failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                media_ref.to_string()
            }
            Err(e) => {
                error!("Failed to run ffmpeg: {}", e);
                media_ref.to_string()
            }
        }
    }

    /// Duration of a media file in seconds via `ffprobe`, `0.0` on any failure
    pub async fn media_duration(&self, media_ref: &str) -> f64 {
        let full_path = self.resolve(media_ref);
        if !full_path.exists() {
            warn!("Media file not found for duration extraction: {:?}", full_path);
            return 0.0;
        }

        let output = Command::new("ffprobe")
            .args([
                "-v",
                "error",
                "-show_entries",
                "format=duration",
                "-of",
                "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(&full_path)
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout)
                .trim()
                .parse()
                .unwrap_or(0.0),
            Ok(_) | Err(_) => {
                error!("Error extracting duration for {}", media_ref);
                0.0
            }
        }
    }
}

fn is_webm(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("webm"))
}

/// File extension for a MIME type (parameters such as `; codecs=opus` ignored)
pub fn extension_for_mime(mime_type: &str) -> &'static str {
    let essence = mime_type.split(';').next().unwrap_or_default().trim();
    match essence {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "video/mp4" => "mp4",
        "video/3gpp" => "3gp",
        "audio/ogg" => "ogg",
        "audio/mpeg" => "mp3",
        "audio/mp4" => "m4a",
        "audio/aac" => "aac",
        "audio/amr" => "amr",
        "audio/webm" | "video/webm" => "webm",
        "application/pdf" => "pdf",
        "text/plain" => "txt",
        _ => "bin",
    }
}

/// MIME type guessed from a file name
pub fn mime_for_filename(name: &str) -> &'static str {
    let extension = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "mp4" => "video/mp4",
        "3gp" => "video/3gpp",
        "webm" => "video/webm",
        "ogg" | "opus" => "audio/ogg",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "aac" => "audio/aac",
        "amr" => "audio/amr",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media_store() -> (tempfile::TempDir, MediaStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MediaStore::new(dir.path(), "/media/");
        (dir, store)
    }

    #[tokio::test]
    async fn test_save_upload_and_remove() {
        let (_dir, store) = media_store();

        let saved = store.save_upload("Nota de voz.WEBM", b"abc").await.unwrap();
        assert!(saved.filename.ends_with(".webm"));
        assert!(saved.url.starts_with("/media/whatsapp/uploads/"));
        assert!(saved.path.exists());
        assert_eq!(store.resolve(&saved.url), saved.path);

        assert!(store.remove_url(&saved.url).await);
        assert!(!saved.path.exists());
        assert!(!store.remove_url(&saved.url).await);
    }

    #[tokio::test]
    async fn test_upload_size_limit() {
        let (_dir, store) = media_store();
        let data = vec![0u8; MAX_UPLOAD_SIZE + 1];

        let err = store.save_upload("big.bin", &data).await.unwrap_err();
        assert!(matches!(err, MediaError::TooLarge { .. }));
    }

    #[tokio::test]
    async fn test_save_incoming_uses_mime_extension() {
        let (_dir, store) = media_store();

        let url = store
            .save_incoming("1234567890", Some("audio/ogg; codecs=opus"), b"ogg")
            .await
            .unwrap();
        assert_eq!(url, "/media/whatsapp/incoming/1234567890.ogg");
        assert!(store.resolve(&url).exists());
    }

    #[tokio::test]
    async fn test_remove_url_rejects_traversal() {
        let (_dir, store) = media_store();
        assert!(!store.remove_url("/media/../secret.txt").await);
    }

    #[test]
    fn test_resolve_forms() {
        let store = MediaStore::new("/srv/media", "/media/");

        assert_eq!(
            store.resolve("/media/whatsapp/uploads/a.jpg"),
            PathBuf::from("/srv/media/whatsapp/uploads/a.jpg")
        );
        assert_eq!(
            store.resolve("whatsapp/uploads/a.jpg"),
            PathBuf::from("/srv/media/whatsapp/uploads/a.jpg")
        );
        assert_eq!(store.resolve("/tmp/a.jpg"), PathBuf::from("/tmp/a.jpg"));
    }

    #[tokio::test]
    async fn test_convert_skips_missing_and_non_webm() {
        let (_dir, store) = media_store();

        assert_eq!(
            store.convert_for_whatsapp("/media/whatsapp/uploads/missing.webm").await,
            "/media/whatsapp/uploads/missing.webm"
        );

        let saved = store.save_upload("photo.jpg", b"jpg").await.unwrap();
        assert_eq!(store.convert_for_whatsapp(&saved.url).await, saved.url);
    }

    #[tokio::test]
    async fn test_duration_of_missing_file() {
        let (_dir, store) = media_store();
        assert_eq!(store.media_duration("nope.ogg").await, 0.0);
    }

    #[test]
    fn test_mime_helpers() {
        assert_eq!(extension_for_mime("image/jpeg"), "jpg");
        assert_eq!(extension_for_mime("application/zip"), "bin");
        assert_eq!(mime_for_filename("a.PDF"), "application/pdf");
        assert_eq!(mime_for_filename("noext"), "application/octet-stream");
    }
}
