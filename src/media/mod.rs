// Media preparation module
// Downloads post media and muxes Reddit video before upload

pub mod download;
pub mod ffmpeg;

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::state::MAX_IMAGES;

pub use download::{download_media, media_filename};
pub use ffmpeg::{audio_url_for, combine_video_audio, DEFAULT_FFMPEG};

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Media host returned HTTP {status} for {url}")]
    Status { status: u16, url: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to run {program}: {source}")]
    FfmpegSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("ffmpeg exited with {code:?}: {stderr}")]
    Ffmpeg { code: Option<i32>, stderr: String },
}

/// Local files ready for upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreparedMedia {
    None,
    Video(PathBuf),
    Images(Vec<PathBuf>),
}

impl PreparedMedia {
    pub fn paths(&self) -> Vec<&Path> {
        match self {
            PreparedMedia::None => Vec::new(),
            PreparedMedia::Video(path) => vec![path.as_path()],
            PreparedMedia::Images(paths) => paths.iter().map(PathBuf::as_path).collect(),
        }
    }

    /// Delete the local files; missing files are ignored
    pub fn cleanup(&self) {
        for path in self.paths() {
            remove_quietly(path);
        }
    }
}

fn remove_quietly(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            log::warn!("Could not remove {}: {}", path.display(), e);
        }
    }
}

/// Fetches media for a post into `work_dir`
pub struct MediaFetcher {
    http: reqwest::Client,
    work_dir: PathBuf,
    ffmpeg: String,
}

impl MediaFetcher {
    pub fn new(work_dir: impl Into<PathBuf>) -> Result<Self, MediaError> {
        let http = reqwest::Client::builder().timeout(DOWNLOAD_TIMEOUT).build()?;
        Ok(MediaFetcher {
            http,
            work_dir: work_dir.into(),
            ffmpeg: DEFAULT_FFMPEG.to_string(),
        })
    }

    pub fn with_ffmpeg(mut self, ffmpeg: impl Into<String>) -> Self {
        self.ffmpeg = ffmpeg.into();
        self
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Video wins over images. A video without a usable audio track is
    /// uploaded muted; a video that cannot be fetched falls back to images.
    /// Individual image failures are skipped.
    pub async fn prepare(
        &self,
        video: Option<&str>,
        images: &[String],
    ) -> Result<PreparedMedia, MediaError> {
        tokio::fs::create_dir_all(&self.work_dir).await?;

        if let Some(video_url) = video {
            match self.prepare_video(video_url).await {
                Ok(path) => return Ok(PreparedMedia::Video(path)),
                Err(e) => log::error!("Failed to prepare video {}: {}", video_url, e),
            }
        }

        let mut paths = Vec::new();
        for image_url in images.iter().take(MAX_IMAGES) {
            let dest = self.work_dir.join(media_filename(image_url, "jpg"));
            match download_media(&self.http, image_url, &dest).await {
                Ok(path) => paths.push(path),
                Err(e) => log::error!("Failed to download media from {}: {}", image_url, e),
            }
        }

        if paths.is_empty() {
            Ok(PreparedMedia::None)
        } else {
            Ok(PreparedMedia::Images(paths))
        }
    }

    async fn prepare_video(&self, video_url: &str) -> Result<PathBuf, MediaError> {
        let digest = media_filename(video_url, "mp4");
        let video_path = self.work_dir.join(format!("video-{}", digest));
        download_media(&self.http, video_url, &video_path).await?;

        let Some(audio_url) = audio_url_for(video_url) else {
            log::info!("No DASH audio for {}, posting muted video", video_url);
            return Ok(video_path);
        };

        let audio_path = self.work_dir.join(format!("audio-{}", digest));
        if let Err(e) = download_media(&self.http, &audio_url, &audio_path).await {
            // Clips without sound have no audio stream
            log::warn!("No audio track for {} ({}), posting muted video", video_url, e);
            remove_quietly(&audio_path);
            return Ok(video_path);
        }

        let combined_path = self.work_dir.join(format!("combined-{}", digest));
        let muxed =
            combine_video_audio(&self.ffmpeg, &video_path, &audio_path, &combined_path).await;
        remove_quietly(&audio_path);

        match muxed {
            Ok(()) => {
                remove_quietly(&video_path);
                Ok(combined_path)
            }
            Err(e) => {
                log::error!("Failed to combine video and audio: {}, posting muted video", e);
                remove_quietly(&combined_path);
                Ok(video_path)
            }
        }
    }
}
