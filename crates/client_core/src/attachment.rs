use base64::{engine::general_purpose::STANDARD, Engine as _};
use shared::{domain::Attachment, error::SessionError};

pub const MAX_ATTACHMENT_BYTES: u64 = 5 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentLimits {
    pub max_bytes: u64,
    /// Accepted `type/` prefixes, e.g. `image/`.
    pub mime_prefixes: Vec<String>,
    pub mime_types: Vec<String>,
}

impl Default for AttachmentLimits {
    fn default() -> Self {
        Self {
            max_bytes: MAX_ATTACHMENT_BYTES,
            mime_prefixes: vec!["image/".to_string()],
            mime_types: vec![
                "application/pdf".to_string(),
                "application/msword".to_string(),
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
                    .to_string(),
            ],
        }
    }
}

impl AttachmentLimits {
    pub fn accepts_mime(&self, mime_type: &str) -> bool {
        let mime_type = mime_type.trim().to_ascii_lowercase();
        self.mime_types.iter().any(|allowed| *allowed == mime_type)
            || self
                .mime_prefixes
                .iter()
                .any(|prefix| mime_type.starts_with(prefix.as_str()))
    }

    pub fn validate(&self, attachment: &Attachment) -> Result<(), SessionError> {
        if attachment.name.trim().is_empty() {
            return Err(SessionError::validation("attachment name is empty"));
        }
        if !self.accepts_mime(&attachment.mime_type) {
            return Err(SessionError::validation(format!(
                "attachment type {} is not allowed",
                attachment.mime_type
            )));
        }
        let size = attachment.size.max(decoded_len(&attachment.encoded_data));
        if size > self.max_bytes {
            return Err(SessionError::validation(format!(
                "attachment {} is {size} bytes; limit is {} bytes",
                attachment.name, self.max_bytes
            )));
        }
        Ok(())
    }
}

/// Builds an attachment whose payload is a base64 data URL of `bytes`.
pub fn encode_attachment(name: &str, mime_type: &str, bytes: &[u8]) -> Attachment {
    Attachment {
        name: name.to_string(),
        mime_type: mime_type.to_string(),
        encoded_data: format!("data:{mime_type};base64,{}", STANDARD.encode(bytes)),
        size: bytes.len() as u64,
    }
}

/// Decodes a data URL (or bare base64) payload back into bytes.
pub fn decode_attachment(attachment: &Attachment) -> Result<Vec<u8>, SessionError> {
    STANDARD
        .decode(base64_payload(&attachment.encoded_data))
        .map_err(|err| {
            SessionError::validation(format!("attachment {} is not base64: {err}", attachment.name))
        })
}

fn base64_payload(encoded: &str) -> &str {
    match encoded.split_once(";base64,") {
        Some((_, payload)) => payload,
        None => encoded,
    }
}

// Upper bound of the decoded size without decoding the payload.
fn decoded_len(encoded: &str) -> u64 {
    let payload = base64_payload(encoded).trim_end_matches('=');
    (payload.len() as u64 * 3) / 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_images_and_documents_only() {
        let limits = AttachmentLimits::default();
        assert!(limits.accepts_mime("image/png"));
        assert!(limits.accepts_mime("Image/JPEG"));
        assert!(limits.accepts_mime("application/pdf"));
        assert!(limits.accepts_mime("application/msword"));
        assert!(!limits.accepts_mime("application/x-msdownload"));
        assert!(!limits.accepts_mime("text/html"));
    }

    #[test]
    fn encoded_attachment_decodes_to_original_bytes() {
        let attachment = encode_attachment("cat.png", "image/png", b"\x89PNG fake");
        assert!(attachment.encoded_data.starts_with("data:image/png;base64,"));
        assert_eq!(attachment.size, 9);
        assert_eq!(decode_attachment(&attachment).expect("decode"), b"\x89PNG fake");
        AttachmentLimits::default()
            .validate(&attachment)
            .expect("valid attachment");
    }

    #[test]
    fn oversized_payload_is_rejected_even_when_size_understated() {
        let limits = AttachmentLimits {
            max_bytes: 8,
            ..AttachmentLimits::default()
        };
        let mut attachment = encode_attachment("big.png", "image/png", &[0u8; 64]);
        attachment.size = 1;
        let err = limits.validate(&attachment).expect_err("too large");
        assert_eq!(err.kind(), shared::error::ErrorKind::ValidationFailure);
    }

    #[test]
    fn disallowed_type_is_rejected() {
        let attachment = encode_attachment("run.exe", "application/x-msdownload", b"MZ");
        assert!(AttachmentLimits::default().validate(&attachment).is_err());
    }
}
