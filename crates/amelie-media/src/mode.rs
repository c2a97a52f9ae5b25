//! Description modes and their resolution from conversation settings.

use serde::Serialize;

use amelie_types::{ConversationConfig, DetailLevel, MediaKind, VideoMode};

/// Concrete instruction set the engine is invoked with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptionMode {
    /// Short image description.
    ConciseImage,
    /// Exhaustive image description.
    ExhaustiveImage,
    /// Single-caption video summary.
    VideoCaption,
    /// Scene-by-scene video description.
    VideoScenes,
    AudioTranscription,
    DocumentExtraction,
}

/// Resolve the mode for `kind` under `config`.
///
/// Detail level only affects images and video mode only affects videos;
/// audio and documents always use their intrinsic mode.
pub fn resolve(config: &ConversationConfig, kind: MediaKind) -> DescriptionMode {
    match kind {
        MediaKind::Image => match config.detail_level {
            DetailLevel::Short => DescriptionMode::ConciseImage,
            DetailLevel::Long => DescriptionMode::ExhaustiveImage,
        },
        MediaKind::Video => match config.video_mode {
            VideoMode::CaptionOnly => DescriptionMode::VideoCaption,
            VideoMode::Full => DescriptionMode::VideoScenes,
        },
        MediaKind::Audio => DescriptionMode::AudioTranscription,
        MediaKind::Document => DescriptionMode::DocumentExtraction,
    }
}

impl DescriptionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DescriptionMode::ConciseImage => "concise_image",
            DescriptionMode::ExhaustiveImage => "exhaustive_image",
            DescriptionMode::VideoCaption => "video_caption",
            DescriptionMode::VideoScenes => "video_scenes",
            DescriptionMode::AudioTranscription => "audio_transcription",
            DescriptionMode::DocumentExtraction => "document_extraction",
        }
    }

    /// Task prompt sent along with the media.
    pub fn prompt(&self) -> &'static str {
        match self {
            DescriptionMode::ConciseImage => {
                "Describe this image for a blind person in two or three sentences. \
                 Mention the main subject, the setting and any clearly visible text."
            }
            DescriptionMode::ExhaustiveImage => {
                "Describe this image for a blind person in full detail. Cover every \
                 person or object, their actions, expressions, clothing and colors, the \
                 layout from left to right and top to bottom, the background and the \
                 lighting. Transcribe all visible text word for word."
            }
            DescriptionMode::VideoCaption => {
                "Summarize this video for a blind person in one short paragraph: what \
                 happens, who appears and where it takes place."
            }
            DescriptionMode::VideoScenes => {
                "Describe this video for a blind person scene by scene, in order. For \
                 each scene give the approximate time, what is shown, the actions, any \
                 on-screen text, and relevant speech or sounds."
            }
            DescriptionMode::AudioTranscription => {
                "Transcribe the speech in this audio. Mark changes of speaker and note \
                 relevant non-speech sounds in parentheses. If there is no speech, \
                 describe what can be heard."
            }
            DescriptionMode::DocumentExtraction => {
                "Read this document for a blind person. Start with a one-paragraph \
                 summary, then give its content in reading order, describing tables, \
                 charts and images in words."
            }
        }
    }
}

impl std::fmt::Display for DescriptionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_KINDS: [MediaKind; 4] = [
        MediaKind::Image,
        MediaKind::Video,
        MediaKind::Audio,
        MediaKind::Document,
    ];

    fn config(detail: DetailLevel, video: VideoMode) -> ConversationConfig {
        ConversationConfig {
            conversation_id: "c".into(),
            detail_level: detail,
            video_mode: video,
        }
    }

    #[test]
    fn test_default_config_resolves_to_short_and_caption() {
        let defaults = ConversationConfig::defaults_for("c");
        assert_eq!(
            resolve(&defaults, MediaKind::Image),
            DescriptionMode::ConciseImage
        );
        assert_eq!(
            resolve(&defaults, MediaKind::Video),
            DescriptionMode::VideoCaption
        );
    }

    #[test]
    fn test_image_follows_detail_level() {
        let long = config(DetailLevel::Long, VideoMode::CaptionOnly);
        assert_eq!(
            resolve(&long, MediaKind::Image),
            DescriptionMode::ExhaustiveImage
        );
    }

    #[test]
    fn test_video_follows_video_mode() {
        let full = config(DetailLevel::Short, VideoMode::Full);
        assert_eq!(resolve(&full, MediaKind::Video), DescriptionMode::VideoScenes);
    }

    #[test]
    fn test_audio_and_document_ignore_flags() {
        for detail in [DetailLevel::Short, DetailLevel::Long] {
            for video in [VideoMode::CaptionOnly, VideoMode::Full] {
                let c = config(detail, video);
                assert_eq!(
                    resolve(&c, MediaKind::Audio),
                    DescriptionMode::AudioTranscription
                );
                assert_eq!(
                    resolve(&c, MediaKind::Document),
                    DescriptionMode::DocumentExtraction
                );
            }
        }
    }

    #[test]
    fn test_resolution_is_total_and_prompts_non_empty() {
        for detail in [DetailLevel::Short, DetailLevel::Long] {
            for video in [VideoMode::CaptionOnly, VideoMode::Full] {
                for kind in ALL_KINDS {
                    let mode = resolve(&config(detail, video), kind);
                    assert!(!mode.prompt().is_empty());
                }
            }
        }
    }
}
