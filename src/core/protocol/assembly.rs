//! Receiver side of the data-channel protocol.
//!
//! A two-state machine: *idle* (no assembly) or *assembling* (one assembly
//! open). At most one assembly exists at a time; the slot is an `Option` so
//! a second concurrent one cannot be represented.
//!
//! Anomalies never fail the session:
//! - payload while idle is dropped;
//! - a second `META` replaces the open assembly (a retry when the id
//!   matches, otherwise the displaced transfer is reported);
//! - `DONE` for another id is dropped and the assembly stays open;
//! - `DONE` with a byte count different from the announced size closes
//!   the assembly as failed and is not acknowledged.

use bytes::{Bytes, BytesMut};
use tracing::{debug, info, warn};

use super::frame::{ChatText, DoneMarker, FileMeta, Frame};

/// One file being received.
#[derive(Debug)]
pub struct ReceiveAssembly {
    meta: FileMeta,
    received_bytes: u64,
    chunks: Vec<Bytes>,
}

impl ReceiveAssembly {
    fn new(meta: FileMeta) -> Self {
        Self {
            meta,
            received_bytes: 0,
            chunks: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    fn assemble(self) -> CompletedFile {
        let mut data = BytesMut::with_capacity(self.received_bytes as usize);
        for chunk in self.chunks {
            data.extend_from_slice(&chunk);
        }
        CompletedFile {
            meta: self.meta,
            data: data.freeze(),
        }
    }
}

/// A fully received file, handed off to the artifact store.
#[derive(Debug)]
pub struct CompletedFile {
    pub meta: FileMeta,
    pub data: Bytes,
}

/// Why a frame was dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anomaly {
    /// Payload arrived with no assembly open.
    StrayChunk { len: usize },
    /// `DONE` arrived with no assembly open.
    DoneWhileIdle { id: String },
    /// `DONE` named a different transfer than the open one.
    DoneMismatch { expected: String, got: String },
}

/// What the caller must do after feeding a frame.
#[derive(Debug)]
pub enum ReceiveOutcome {
    /// A new assembly opened. `displaced` names a different transfer whose
    /// assembly was discarded to make room.
    Opened {
        meta: FileMeta,
        displaced: Option<String>,
    },
    /// Payload was appended.
    Progress { id: String, received: u64 },
    /// The assembly closed cleanly; reply with `ACK_RECEIVED`.
    Completed(CompletedFile),
    /// The assembly closed with a size mismatch, either at `DONE` or as soon
    /// as payload ran past the announced size; do not acknowledge.
    SizeMismatch {
        id: String,
        expected: u64,
        actual: u64,
    },
    Chat(ChatText),
    Ack,
    Heartbeat,
    Dropped(Anomaly),
}

/// The receive-side state machine.
#[derive(Debug, Default)]
pub struct Receiver {
    slot: Option<ReceiveAssembly>,
}

impl Receiver {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn is_assembling(&self) -> bool {
        self.slot.is_some()
    }

    #[cfg(test)]
    pub fn current(&self) -> Option<&ReceiveAssembly> {
        self.slot.as_ref()
    }

    /// Feed one decoded frame.
    pub fn accept(&mut self, frame: Frame) -> ReceiveOutcome {
        match frame {
            Frame::Meta(meta) => self.open(meta),
            Frame::Chunk(data) => self.append(data),
            Frame::Done(done) => self.close(done),
            Frame::Text(chat) => ReceiveOutcome::Chat(chat),
            Frame::Ack => ReceiveOutcome::Ack,
            Frame::Heartbeat => ReceiveOutcome::Heartbeat,
        }
    }

    /// Discard the open assembly, e.g. when the channel goes away.
    pub fn abort(&mut self) -> Option<FileMeta> {
        self.slot.take().map(|a| a.meta)
    }

    fn open(&mut self, meta: FileMeta) -> ReceiveOutcome {
        let displaced = match self.slot.take() {
            Some(prev) if prev.meta.id == meta.id => {
                info!(
                    event = "receive_restart",
                    id = %meta.id,
                    discarded = prev.received_bytes,
                    "Transfer restarted by sender, discarding partial data"
                );
                None
            }
            Some(prev) => {
                warn!(
                    event = "receive_displaced",
                    previous = %prev.meta.id,
                    next = %meta.id,
                    "META arrived before DONE, dropping previous transfer"
                );
                Some(prev.meta.id)
            }
            None => None,
        };

        debug!(id = %meta.id, name = %meta.name, size = meta.size, "Receive assembly opened");
        self.slot = Some(ReceiveAssembly::new(meta.clone()));
        ReceiveOutcome::Opened { meta, displaced }
    }

    fn append(&mut self, data: Bytes) -> ReceiveOutcome {
        let Some(assembly) = self.slot.as_mut() else {
            warn!(
                event = "stray_chunk",
                len = data.len(),
                "Binary chunk without META, dropping"
            );
            return ReceiveOutcome::Dropped(Anomaly::StrayChunk { len: data.len() });
        };

        let received = assembly.received_bytes + data.len() as u64;
        if received > assembly.meta.size {
            let expected = assembly.meta.size;
            let id = assembly.meta.id.clone();
            warn!(
                event = "size_overflow",
                id = %id,
                expected,
                actual = received,
                "Payload exceeds announced size, closing transfer"
            );
            self.slot = None;
            return ReceiveOutcome::SizeMismatch {
                id,
                expected,
                actual: received,
            };
        }

        assembly.received_bytes = received;
        assembly.chunks.push(data);
        ReceiveOutcome::Progress {
            id: assembly.meta.id.clone(),
            received: assembly.received_bytes,
        }
    }

    fn close(&mut self, done: DoneMarker) -> ReceiveOutcome {
        let Some(assembly) = self.slot.take() else {
            warn!(event = "stray_done", id = %done.id, "DONE with no active transfer, dropping");
            return ReceiveOutcome::Dropped(Anomaly::DoneWhileIdle { id: done.id });
        };

        if assembly.meta.id != done.id {
            warn!(
                event = "done_mismatch",
                expected = %assembly.meta.id,
                got = %done.id,
                "DONE for a different transfer, dropping"
            );
            let expected = assembly.meta.id.clone();
            self.slot = Some(assembly);
            return ReceiveOutcome::Dropped(Anomaly::DoneMismatch {
                expected,
                got: done.id,
            });
        }

        if assembly.received_bytes != assembly.meta.size {
            warn!(
                event = "size_mismatch",
                id = %done.id,
                expected = assembly.meta.size,
                actual = assembly.received_bytes,
                "Received size differs from announced size"
            );
            return ReceiveOutcome::SizeMismatch {
                id: done.id,
                expected: assembly.meta.size,
                actual: assembly.received_bytes,
            };
        }

        ReceiveOutcome::Completed(assembly.assemble())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(id: &str, size: u64) -> FileMeta {
        FileMeta {
            id: id.into(),
            name: format!("{id}.bin"),
            size,
            mime: "application/octet-stream".into(),
        }
    }

    fn done(id: &str) -> Frame {
        Frame::Done(DoneMarker { id: id.into() })
    }

    fn chunk(data: &'static [u8]) -> Frame {
        Frame::Chunk(Bytes::from_static(data))
    }

    #[test]
    fn test_full_assembly() {
        let mut rx = Receiver::new();
        assert!(matches!(
            rx.accept(Frame::Meta(meta("a", 5))),
            ReceiveOutcome::Opened { displaced: None, .. }
        ));
        assert!(matches!(
            rx.accept(chunk(b"he")),
            ReceiveOutcome::Progress { received: 2, .. }
        ));
        rx.accept(chunk(b"llo"));
        match rx.accept(done("a")) {
            ReceiveOutcome::Completed(file) => {
                assert_eq!(&file.data[..], b"hello");
                assert_eq!(file.meta.id, "a");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!rx.is_assembling());
    }

    #[test]
    fn test_empty_file_completes() {
        let mut rx = Receiver::new();
        rx.accept(Frame::Meta(meta("empty", 0)));
        match rx.accept(done("empty")) {
            ReceiveOutcome::Completed(file) => assert!(file.data.is_empty()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_chunk_while_idle_is_dropped() {
        let mut rx = Receiver::new();
        assert!(matches!(
            rx.accept(chunk(b"xyz")),
            ReceiveOutcome::Dropped(Anomaly::StrayChunk { len: 3 })
        ));
        assert!(!rx.is_assembling());
    }

    #[test]
    fn test_done_for_other_id_keeps_assembly() {
        let mut rx = Receiver::new();
        rx.accept(Frame::Meta(meta("a", 1)));
        rx.accept(chunk(b"x"));
        assert!(matches!(
            rx.accept(done("b")),
            ReceiveOutcome::Dropped(Anomaly::DoneMismatch { .. })
        ));
        assert_eq!(rx.current().unwrap().received_bytes(), 1);
        assert!(matches!(rx.accept(done("a")), ReceiveOutcome::Completed(_)));
    }

    #[test]
    fn test_size_mismatch_is_not_completed() {
        let mut rx = Receiver::new();
        rx.accept(Frame::Meta(meta("a", 10)));
        rx.accept(chunk(b"abc"));
        assert!(matches!(
            rx.accept(done("a")),
            ReceiveOutcome::SizeMismatch {
                expected: 10,
                actual: 3,
                ..
            }
        ));
        assert!(!rx.is_assembling());
    }

    #[test]
    fn test_payload_past_announced_size_closes_assembly() {
        let mut rx = Receiver::new();
        rx.accept(Frame::Meta(meta("big", 1)));
        let block = Bytes::from(vec![7u8; 64 * 1024]);

        match rx.accept(Frame::Chunk(block.clone())) {
            ReceiveOutcome::SizeMismatch { id, expected, actual } => {
                assert_eq!(id, "big");
                assert_eq!(expected, 1);
                assert_eq!(actual, 64 * 1024);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!rx.is_assembling());

        // The rest of the flood is stray and nothing is buffered.
        for _ in 1..100 {
            assert!(matches!(
                rx.accept(Frame::Chunk(block.clone())),
                ReceiveOutcome::Dropped(Anomaly::StrayChunk { .. })
            ));
        }
        assert!(matches!(
            rx.accept(done("big")),
            ReceiveOutcome::Dropped(Anomaly::DoneWhileIdle { .. })
        ));
    }

    #[test]
    fn test_exact_size_is_not_overflow() {
        let mut rx = Receiver::new();
        rx.accept(Frame::Meta(meta("a", 4)));
        rx.accept(chunk(b"ab"));
        assert!(matches!(
            rx.accept(chunk(b"cd")),
            ReceiveOutcome::Progress { received: 4, .. }
        ));
        assert!(matches!(rx.accept(chunk(b"e")), ReceiveOutcome::SizeMismatch { actual: 5, .. }));
    }

    #[test]
    fn test_second_meta_same_id_restarts() {
        let mut rx = Receiver::new();
        rx.accept(Frame::Meta(meta("a", 3)));
        rx.accept(chunk(b"ab"));
        assert!(matches!(
            rx.accept(Frame::Meta(meta("a", 3))),
            ReceiveOutcome::Opened { displaced: None, .. }
        ));
        assert_eq!(rx.current().unwrap().received_bytes(), 0);
        rx.accept(chunk(b"abc"));
        match rx.accept(done("a")) {
            ReceiveOutcome::Completed(file) => assert_eq!(&file.data[..], b"abc"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_second_meta_other_id_displaces() {
        let mut rx = Receiver::new();
        rx.accept(Frame::Meta(meta("a", 3)));
        match rx.accept(Frame::Meta(meta("b", 1))) {
            ReceiveOutcome::Opened { meta, displaced } => {
                assert_eq!(meta.id, "b");
                assert_eq!(displaced.as_deref(), Some("a"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_control_frames_pass_through_while_assembling() {
        let mut rx = Receiver::new();
        rx.accept(Frame::Meta(meta("a", 3)));
        assert!(matches!(rx.accept(Frame::Heartbeat), ReceiveOutcome::Heartbeat));
        assert!(matches!(rx.accept(Frame::Ack), ReceiveOutcome::Ack));
        assert!(matches!(
            rx.accept(Frame::Text(ChatText {
                id: "c".into(),
                text: "hi".into()
            })),
            ReceiveOutcome::Chat(_)
        ));
        assert!(rx.is_assembling());
    }

    #[test]
    fn test_abort_discards() {
        let mut rx = Receiver::new();
        rx.accept(Frame::Meta(meta("a", 3)));
        assert_eq!(rx.abort().map(|m| m.id), Some("a".to_string()));
        assert!(rx.abort().is_none());
    }
}
