// Reddit DASH muxing
// Reddit serves video and audio as separate DASH streams; ffmpeg joins them

use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;
use tokio::process::Command;

use super::MediaError;

pub const DEFAULT_FFMPEG: &str = "ffmpeg";
pub const AUDIO_STREAM: &str = "DASH_AUDIO_128.mp4";

fn dash_video_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"DASH_[0-9]+\.mp4").expect("static DASH pattern"))
}

/// Audio stream URL that belongs to a DASH video URL, e.g.
/// `.../DASH_720.mp4?source=fallback` -> `.../DASH_AUDIO_128.mp4?source=fallback`
pub fn audio_url_for(video_url: &str) -> Option<String> {
    let pattern = dash_video_pattern();
    if !pattern.is_match(video_url) {
        return None;
    }
    Some(pattern.replace(video_url, AUDIO_STREAM).into_owned())
}

/// Mux `video` and `audio` into `output`: video copied, audio re-encoded to AAC
pub async fn combine_video_audio(
    ffmpeg: &str,
    video: &Path,
    audio: &Path,
    output: &Path,
) -> Result<(), MediaError> {
    let result = Command::new(ffmpeg)
        .arg("-y")
        .args(["-loglevel", "error"])
        .arg("-i")
        .arg(video)
        .arg("-i")
        .arg(audio)
        .args(["-c:v", "copy", "-c:a", "aac", "-strict", "experimental"])
        .arg(output)
        .output()
        .await
        .map_err(|source| MediaError::FfmpegSpawn {
            program: ffmpeg.to_string(),
            source,
        })?;

    if !result.status.success() {
        let stderr = String::from_utf8_lossy(&result.stderr);
        return Err(MediaError::Ffmpeg {
            code: result.status.code(),
            stderr: stderr.trim().to_string(),
        });
    }

    log::info!("Combined video and audio into {}", output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_audio_url_for_720() {
        assert_eq!(
            audio_url_for("https://v.redd.it/abc/DASH_720.mp4").as_deref(),
            Some("https://v.redd.it/abc/DASH_AUDIO_128.mp4")
        );
    }

    #[test]
    fn test_audio_url_keeps_query() {
        assert_eq!(
            audio_url_for("https://v.redd.it/abc/DASH_1080.mp4?source=fallback").as_deref(),
            Some("https://v.redd.it/abc/DASH_AUDIO_128.mp4?source=fallback")
        );
    }

    #[test]
    fn test_audio_url_non_dash() {
        assert!(audio_url_for("https://example.com/clip.mp4").is_none());
    }

    #[tokio::test]
    async fn test_missing_ffmpeg_binary() {
        let temp_dir = TempDir::new().unwrap();
        let video = temp_dir.path().join("v.mp4");
        let audio = temp_dir.path().join("a.mp4");
        let output = temp_dir.path().join("out.mp4");

        let result =
            combine_video_audio("ffmpeg-not-installed-here", &video, &audio, &output).await;
        assert!(matches!(result, Err(MediaError::FfmpegSpawn { .. })));
    }
}
