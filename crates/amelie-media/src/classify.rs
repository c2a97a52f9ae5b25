//! Media classification: decide what an inbound payload is.
//!
//! The declared MIME type wins when it is concrete. Generic or missing types
//! fall back to the file extension, then to magic-byte sniffing, and finally
//! to `Document`.

use bytes::Bytes;

use amelie_types::{MediaKind, MediaPayload};

use crate::error::ClassificationError;

/// Raw media descriptor handed over by the transport.
#[derive(Debug, Clone)]
pub struct RawInboundMessage {
    pub conversation_id: String,
    pub media: MediaPayload,
    /// Text the sender attached to the media.
    pub caption: Option<String>,
}

/// A classified media event. Owns the payload until storage takes it over.
#[derive(Debug, Clone)]
pub struct MediaEvent {
    pub conversation_id: String,
    pub kind: MediaKind,
    /// Normalized, concrete MIME type.
    pub mime_type: String,
    pub size_bytes: u64,
    pub payload: Bytes,
}

/// Limits applied while classifying.
#[derive(Debug, Clone, Copy)]
pub struct ClassifierLimits {
    pub max_payload_bytes: u64,
}

impl Default for ClassifierLimits {
    fn default() -> Self {
        Self {
            max_payload_bytes: 20 * 1024 * 1024,
        }
    }
}

/// MIME types that say nothing about the content.
const GENERIC_MIME_TYPES: &[&str] = &[
    "application/octet-stream",
    "binary/octet-stream",
    "application/binary",
    "application/x-binary",
    "application/unknown",
    "application/force-download",
];

/// Non-`text/*` MIME types accepted as documents.
const DOCUMENT_MIME_TYPES: &[&str] = &[
    "application/pdf",
    "application/rtf",
    "application/json",
    "application/xml",
    "application/epub+zip",
    "application/msword",
    "application/vnd.ms-excel",
    "application/vnd.ms-powerpoint",
    "image/svg+xml",
];

const DOCUMENT_MIME_PREFIXES: &[&str] = &[
    "application/vnd.openxmlformats-officedocument.",
    "application/vnd.oasis.opendocument.",
];

const EXTENSION_TABLE: &[(&str, &str)] = &[
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("png", "image/png"),
    ("webp", "image/webp"),
    ("gif", "image/gif"),
    ("heic", "image/heic"),
    ("heif", "image/heif"),
    ("bmp", "image/bmp"),
    ("tif", "image/tiff"),
    ("tiff", "image/tiff"),
    ("mp4", "video/mp4"),
    ("m4v", "video/mp4"),
    ("mov", "video/quicktime"),
    ("webm", "video/webm"),
    ("mkv", "video/x-matroska"),
    ("avi", "video/x-msvideo"),
    ("3gp", "video/3gpp"),
    ("ogg", "audio/ogg"),
    ("oga", "audio/ogg"),
    ("opus", "audio/ogg"),
    ("mp3", "audio/mpeg"),
    ("m4a", "audio/mp4"),
    ("aac", "audio/aac"),
    ("wav", "audio/wav"),
    ("flac", "audio/flac"),
    ("pdf", "application/pdf"),
    ("md", "text/markdown"),
    ("markdown", "text/markdown"),
    ("txt", "text/plain"),
    ("csv", "text/csv"),
    ("html", "text/html"),
    ("htm", "text/html"),
    ("rtf", "application/rtf"),
    ("json", "application/json"),
    ("epub", "application/epub+zip"),
    (
        "docx",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    ),
    (
        "xlsx",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    ),
    (
        "pptx",
        "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    ),
    ("odt", "application/vnd.oasis.opendocument.text"),
];

/// Classify a raw inbound payload.
///
/// Pure: reads only metadata and bytes already attached to the message.
pub fn classify(
    raw: &RawInboundMessage,
    limits: &ClassifierLimits,
) -> Result<MediaEvent, ClassificationError> {
    let media = &raw.media;

    let size = media.effective_size();
    if size > limits.max_payload_bytes {
        return Err(ClassificationError::PayloadTooLarge {
            size,
            limit: limits.max_payload_bytes,
        });
    }

    let payload = match &media.data {
        Some(data) if !data.is_empty() => data.clone(),
        _ => return Err(ClassificationError::EmptyPayload),
    };

    let declared = media
        .mime_type
        .as_deref()
        .map(normalize_mime)
        .filter(|m| !m.is_empty());

    let (kind, mime_type) = match declared {
        Some(mime) if !GENERIC_MIME_TYPES.contains(&mime.as_str()) => {
            match kind_for_mime(&mime) {
                Some(kind) => (kind, mime),
                None => return Err(ClassificationError::UnsupportedMedia { mime }),
            }
        }
        _ => infer_kind(media.file_name.as_deref(), &payload),
    };

    Ok(MediaEvent {
        conversation_id: raw.conversation_id.clone(),
        kind,
        mime_type,
        size_bytes: payload.len() as u64,
        payload,
    })
}

/// Lowercase and strip parameters (`; charset=...`).
pub fn normalize_mime(mime: &str) -> String {
    mime.split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

/// Map a concrete MIME type to a media kind.
pub fn kind_for_mime(mime: &str) -> Option<MediaKind> {
    if DOCUMENT_MIME_TYPES.contains(&mime)
        || DOCUMENT_MIME_PREFIXES.iter().any(|p| mime.starts_with(p))
        || mime.starts_with("text/")
    {
        return Some(MediaKind::Document);
    }
    if mime.starts_with("image/") {
        return Some(MediaKind::Image);
    }
    if mime.starts_with("video/") {
        return Some(MediaKind::Video);
    }
    if mime.starts_with("audio/") || mime == "application/ogg" {
        return Some(MediaKind::Audio);
    }
    None
}

fn mime_for_extension(file_name: &str) -> Option<&'static str> {
    let (_, ext) = file_name.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();
    EXTENSION_TABLE
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, mime)| *mime)
}

fn infer_kind(file_name: Option<&str>, payload: &[u8]) -> (MediaKind, String) {
    let by_extension = file_name
        .and_then(mime_for_extension)
        .and_then(|mime| kind_for_mime(mime).map(|kind| (kind, mime)));
    if let Some((kind, mime)) = by_extension {
        return (kind, mime.to_string());
    }

    let sniffed = infer::get(payload)
        .and_then(|found| kind_for_mime(found.mime_type()).map(|kind| (kind, found.mime_type())));
    if let Some((kind, mime)) = sniffed {
        return (kind, mime.to_string());
    }

    let mime = if std::str::from_utf8(payload).is_ok() {
        "text/plain"
    } else {
        "application/octet-stream"
    };
    (MediaKind::Document, mime.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];
    const PDF_MAGIC: &[u8] = b"%PDF-1.7\n%\xE2\xE3\xCF\xD3\n";

    fn raw(mime: Option<&str>, name: Option<&str>, data: &[u8]) -> RawInboundMessage {
        let mut media = MediaPayload::from_bytes(data.to_vec(), mime.map(String::from));
        media.file_name = name.map(String::from);
        RawInboundMessage {
            conversation_id: "chat-1".into(),
            media,
            caption: None,
        }
    }

    fn kind_of(r: &RawInboundMessage) -> (MediaKind, String) {
        let event = classify(r, &ClassifierLimits::default()).unwrap();
        (event.kind, event.mime_type)
    }

    #[test]
    fn test_declared_mime_wins() {
        assert_eq!(
            kind_of(&raw(Some("image/jpeg"), None, b"x")),
            (MediaKind::Image, "image/jpeg".into())
        );
        assert_eq!(
            kind_of(&raw(Some("video/mp4"), Some("a.pdf"), b"x")).0,
            MediaKind::Video
        );
        assert_eq!(
            kind_of(&raw(Some("Audio/OGG; codecs=opus"), None, b"x")),
            (MediaKind::Audio, "audio/ogg".into())
        );
        assert_eq!(
            kind_of(&raw(Some("application/pdf"), None, b"x")).0,
            MediaKind::Document
        );
        assert_eq!(
            kind_of(&raw(Some("text/markdown"), None, b"# hi")).0,
            MediaKind::Document
        );
        assert_eq!(
            kind_of(&raw(Some("image/svg+xml"), None, b"<svg/>")).0,
            MediaKind::Document
        );
    }

    #[test]
    fn test_unsupported_concrete_mime() {
        let err = classify(
            &raw(Some("application/x-msdownload"), Some("setup.exe"), b"MZ"),
            &ClassifierLimits::default(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            ClassificationError::UnsupportedMedia {
                mime: "application/x-msdownload".into()
            }
        );
    }

    #[test]
    fn test_generic_mime_uses_extension() {
        assert_eq!(
            kind_of(&raw(
                Some("application/octet-stream"),
                Some("Notes.MD"),
                b"# notes"
            )),
            (MediaKind::Document, "text/markdown".into())
        );
        assert_eq!(
            kind_of(&raw(None, Some("clip.mov"), b"\0\0")).0,
            MediaKind::Video
        );
    }

    #[test]
    fn test_generic_mime_sniffs_magic_bytes() {
        assert_eq!(
            kind_of(&raw(Some("application/octet-stream"), None, PNG_MAGIC)),
            (MediaKind::Image, "image/png".into())
        );
        assert_eq!(
            kind_of(&raw(None, Some("scan"), PDF_MAGIC)),
            (MediaKind::Document, "application/pdf".into())
        );
    }

    #[test]
    fn test_generic_binary_is_document() {
        assert_eq!(
            kind_of(&raw(Some("application/octet-stream"), None, &[0xFF, 0x00, 0xFE])),
            (MediaKind::Document, "application/octet-stream".into())
        );
        assert_eq!(
            kind_of(&raw(None, None, b"plain words")),
            (MediaKind::Document, "text/plain".into())
        );
    }

    #[test]
    fn test_empty_payload() {
        let limits = ClassifierLimits::default();
        assert_eq!(
            classify(&raw(Some("image/png"), None, b""), &limits).unwrap_err(),
            ClassificationError::EmptyPayload
        );

        let mut missing = raw(Some("image/png"), None, b"");
        missing.media.data = None;
        assert_eq!(
            classify(&missing, &limits).unwrap_err(),
            ClassificationError::EmptyPayload
        );
    }

    #[test]
    fn test_payload_too_large_uses_declared_size() {
        let limits = ClassifierLimits {
            max_payload_bytes: 10,
        };
        let mut declared_only = raw(Some("video/mp4"), None, b"");
        declared_only.media.data = None;
        declared_only.media.size_bytes = 11;
        assert_eq!(
            classify(&declared_only, &limits).unwrap_err(),
            ClassificationError::PayloadTooLarge {
                size: 11,
                limit: 10
            }
        );

        let at_limit = raw(Some("image/png"), None, &[1u8; 10]);
        assert!(classify(&at_limit, &limits).is_ok());
    }

    #[test]
    fn test_event_carries_conversation_and_size() {
        let event = classify(
            &raw(Some("image/webp"), None, &[7u8; 5]),
            &ClassifierLimits::default(),
        )
        .unwrap();
        assert_eq!(event.conversation_id, "chat-1");
        assert_eq!(event.size_bytes, 5);
        assert_eq!(&event.payload[..], &[7u8; 5]);
    }
}
