use crate::session::ProtocolKind;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Binary(Bytes),
    Text(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Resize {
        cols: u16,
        rows: u16,
    },
    Key {
        key: String,
    },
    Refresh {
        #[serde(default)]
        full: bool,
    },
    Clipboard {
        text: String,
    },
    Ping {
        nonce: u64,
    },
    Pong {
        nonce: u64,
    },
    Sync {
        offset: u64,
    },
}

impl From<ControlMessage> for WireMessage {
    fn from(value: ControlMessage) -> Self {
        WireMessage::Text(serde_json::to_string(&value).unwrap_or_default())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
    Webp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    pub image: Bytes,
}

impl VideoFrame {
    pub fn encoded_image(&self) -> String {
        STANDARD.encode(&self.image)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Data(Bytes),
    Frame(VideoFrame),
    Control(ControlMessage),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("invalid base64 image payload: {0}")]
    Base64(String),
    #[error("unrecognised image encoding")]
    UnknownImage,
    #[error("invalid frame dimensions {width}x{height}")]
    Dimensions { width: u32, height: u32 },
    #[error("unexpected binary message on a framebuffer session")]
    UnexpectedBinary,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FramePayload {
    width: u32,
    height: u32,
    encoded_image: String,
}

/// Splits an inbound wire message by the session's protocol kind.
///
/// Text-stream sessions treat binary messages as output bytes and text
/// messages as control messages when they parse as one, output otherwise.
/// Framebuffer sessions only accept control messages and JSON video frames.
pub fn decode_inbound(kind: ProtocolKind, message: WireMessage) -> Result<Inbound, DecodeError> {
    match (kind, message) {
        (ProtocolKind::TextStream, WireMessage::Binary(bytes)) => Ok(Inbound::Data(bytes)),
        (ProtocolKind::TextStream, WireMessage::Text(text)) => Ok(match parse_control(&text) {
            Some(control) => Inbound::Control(control),
            None => Inbound::Data(Bytes::from(text)),
        }),
        (ProtocolKind::Framebuffer, WireMessage::Binary(_)) => Err(DecodeError::UnexpectedBinary),
        (ProtocolKind::Framebuffer, WireMessage::Text(text)) => {
            if let Some(control) = parse_control(&text) {
                return Ok(Inbound::Control(control));
            }
            decode_frame(&text).map(Inbound::Frame)
        }
    }
}

fn parse_control(text: &str) -> Option<ControlMessage> {
    let trimmed = text.trim_start();
    if !trimmed.starts_with('{') {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

pub fn decode_frame(text: &str) -> Result<VideoFrame, DecodeError> {
    let payload: FramePayload =
        serde_json::from_str(text).map_err(|err| DecodeError::Malformed(err.to_string()))?;
    if payload.width == 0 || payload.height == 0 {
        return Err(DecodeError::Dimensions {
            width: payload.width,
            height: payload.height,
        });
    }
    let encoded = payload
        .encoded_image
        .split_once(";base64,")
        .map(|(_, data)| data)
        .unwrap_or(&payload.encoded_image);
    let image = STANDARD
        .decode(encoded.trim())
        .map_err(|err| DecodeError::Base64(err.to_string()))?;
    let format = sniff_format(&image).ok_or(DecodeError::UnknownImage)?;
    Ok(VideoFrame {
        width: payload.width,
        height: payload.height,
        format,
        image: Bytes::from(image),
    })
}

fn sniff_format(image: &[u8]) -> Option<ImageFormat> {
    if image.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some(ImageFormat::Png)
    } else if image.starts_with(&[0xff, 0xd8, 0xff]) {
        Some(ImageFormat::Jpeg)
    } else if image.len() >= 12 && &image[..4] == b"RIFF" && &image[8..12] == b"WEBP" {
        Some(ImageFormat::Webp)
    } else {
        None
    }
}

pub fn encode_frame(width: u32, height: u32, image: &[u8]) -> WireMessage {
    let payload = serde_json::json!({
        "width": width,
        "height": height,
        "encodedImage": STANDARD.encode(image),
    });
    WireMessage::Text(payload.to_string())
}
