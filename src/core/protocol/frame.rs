//! Data-channel framing.
//!
//! One channel multiplexes control frames and file payload:
//!
//! ```text
//! text   "META:" + {"id","name","size","mime"}   open a receive assembly
//! binary <bytes>                                   one payload chunk
//! text   "DONE:" + {"id"}                          close the assembly
//! text   "ACK_RECEIVED"                            receiver confirmed DONE
//! text   "TEXT:" + {"id","text"}                   chat message
//! text   "HB"                                      heartbeat, ignored
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const META_PREFIX: &str = "META:";
const DONE_PREFIX: &str = "DONE:";
const TEXT_PREFIX: &str = "TEXT:";
const ACK_FRAME: &str = "ACK_RECEIVED";
const HEARTBEAT_FRAME: &str = "HB";

/// A frame exactly as the data channel delivered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawFrame {
    Text(String),
    Binary(Bytes),
}

/// Announcement of an incoming file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    pub id: String,
    pub name: String,
    pub size: u64,
    #[serde(default)]
    pub mime: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoneMarker {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatText {
    pub id: String,
    pub text: String,
}

/// The closed set of frames understood on the data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Meta(FileMeta),
    Chunk(Bytes),
    Done(DoneMarker),
    Ack,
    Text(ChatText),
    Heartbeat,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("unrecognized text frame: {0:?}")]
    UnknownText(String),
    #[error("malformed {kind} body: {source}")]
    MalformedBody {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Classify a raw channel frame.
pub fn decode(raw: RawFrame) -> Result<Frame, FrameError> {
    let text = match raw {
        RawFrame::Binary(data) => return Ok(Frame::Chunk(data)),
        RawFrame::Text(text) => text,
    };

    if let Some(body) = text.strip_prefix(META_PREFIX) {
        return parse_body(body, "META").map(Frame::Meta);
    }
    if let Some(body) = text.strip_prefix(DONE_PREFIX) {
        return parse_body(body, "DONE").map(Frame::Done);
    }
    if let Some(body) = text.strip_prefix(TEXT_PREFIX) {
        return parse_body(body, "TEXT").map(Frame::Text);
    }
    match text.as_str() {
        ACK_FRAME => Ok(Frame::Ack),
        HEARTBEAT_FRAME => Ok(Frame::Heartbeat),
        _ => Err(FrameError::UnknownText(truncate(&text))),
    }
}

fn parse_body<T: for<'de> Deserialize<'de>>(
    body: &str,
    kind: &'static str,
) -> Result<T, FrameError> {
    serde_json::from_str(body).map_err(|source| FrameError::MalformedBody { kind, source })
}

fn truncate(text: &str) -> String {
    text.chars().take(32).collect()
}

impl Frame {
    /// Render the frame for the wire.
    pub fn encode(&self) -> RawFrame {
        match self {
            Frame::Chunk(data) => RawFrame::Binary(data.clone()),
            Frame::Meta(meta) => RawFrame::Text(format!("{META_PREFIX}{}", to_json(meta))),
            Frame::Done(done) => RawFrame::Text(format!("{DONE_PREFIX}{}", to_json(done))),
            Frame::Text(chat) => RawFrame::Text(format!("{TEXT_PREFIX}{}", to_json(chat))),
            Frame::Ack => RawFrame::Text(ACK_FRAME.to_string()),
            Frame::Heartbeat => RawFrame::Text(HEARTBEAT_FRAME.to_string()),
        }
    }
}

// Serializing these plain structs to a string cannot fail.
fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> RawFrame {
        RawFrame::Text(s.to_string())
    }

    #[test]
    fn test_decode_meta() {
        let frame = decode(text(
            r#"META:{"id":"j1","name":"a.txt","size":12,"mime":"text/plain"}"#,
        ))
        .unwrap();
        assert_eq!(
            frame,
            Frame::Meta(FileMeta {
                id: "j1".into(),
                name: "a.txt".into(),
                size: 12,
                mime: "text/plain".into(),
            })
        );
    }

    #[test]
    fn test_decode_meta_without_mime() {
        let frame = decode(text(r#"META:{"id":"j1","name":"a","size":0}"#)).unwrap();
        match frame {
            Frame::Meta(meta) => assert_eq!(meta.mime, ""),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_decode_bare_frames() {
        assert_eq!(decode(text("ACK_RECEIVED")).unwrap(), Frame::Ack);
        assert_eq!(decode(text("HB")).unwrap(), Frame::Heartbeat);
    }

    #[test]
    fn test_binary_is_always_a_chunk() {
        // Even bytes that spell a control prefix stay payload.
        let data = Bytes::from_static(b"META:{}");
        assert_eq!(
            decode(RawFrame::Binary(data.clone())).unwrap(),
            Frame::Chunk(data)
        );
    }

    #[test]
    fn test_unknown_text_is_rejected() {
        assert!(matches!(
            decode(text("HELLO")),
            Err(FrameError::UnknownText(_))
        ));
        assert!(matches!(
            decode(text("hb")),
            Err(FrameError::UnknownText(_))
        ));
    }

    #[test]
    fn test_malformed_body_is_rejected() {
        let err = decode(text("DONE:{not json")).unwrap_err();
        assert!(matches!(err, FrameError::MalformedBody { kind: "DONE", .. }));
    }

    #[test]
    fn test_encode_wire_shapes() {
        assert_eq!(
            Frame::Done(DoneMarker { id: "j1".into() }).encode(),
            text(r#"DONE:{"id":"j1"}"#)
        );
        assert_eq!(Frame::Ack.encode(), text("ACK_RECEIVED"));
        assert_eq!(Frame::Heartbeat.encode(), text("HB"));
        assert_eq!(
            Frame::Text(ChatText {
                id: "c".into(),
                text: "hi".into()
            })
            .encode(),
            text(r#"TEXT:{"id":"c","text":"hi"}"#)
        );
    }

    #[test]
    fn test_chat_survives_prefix_inside_text() {
        let chat = Frame::Text(ChatText {
            id: "c".into(),
            text: "DONE:META:HB".into(),
        });
        assert_eq!(decode(chat.encode()).unwrap(), chat);
    }
}
