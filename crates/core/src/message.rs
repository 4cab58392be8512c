//! Uniform message abstraction (spec §3.1–§3.2).
//!
//! A [`Message`] wraps a transport-specific [`SourceMessage`] and adds the
//! source/current data-and-metadata split that runners observe, a
//! read-mostly filesystem view, and a one-shot ack state machine. Ownership
//! mirrors `runtime-core/src/transport/session.rs`'s `StreamSessionHandle`:
//! a small public handle backed by an `Arc`'d inner state shared between the
//! worker that drives it and whatever closures capture it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::contract::SourceMessage;
use crate::error::{Error, Result};
use crate::vfs::{Filesystem, SingleFileFs};

/// Response payload + metadata captured from a target and carried back
/// through the source for request/response transports (spec §3.2).
#[derive(Debug, Clone, Default)]
pub struct ReplyData {
    pub data: Vec<u8>,
    pub metadata: HashMap<String, String>,
}

impl ReplyData {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Terminal ack outcome. `Replied` is `Acked` carrying a response payload;
/// kept as a distinct state so `ack_state()` can report it precisely, per
/// spec §3.1's `Pending → {Acked, Nakked, Replied, TimedOut}` machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckState {
    Pending,
    Acked,
    Nakked,
    Replied,
    TimedOut,
}

impl AckState {
    fn is_terminal(self) -> bool {
        !matches!(self, AckState::Pending)
    }
}

/// Reserved metadata key set by a request/response target that captured a
/// transport-native status code (spec §6).
pub const METADATA_STATUS_KEY: &str = "eb-status";

struct MessageInner {
    source: Box<dyn SourceMessage>,
    source_data: Vec<u8>,
    source_metadata: HashMap<String, String>,
    current_data: RwLock<Option<Vec<u8>>>,
    current_metadata: RwLock<HashMap<String, String>>,
    filesystem: RwLock<Option<Arc<dyn Filesystem>>>,
    ack_state: Mutex<AckState>,
}

/// A message flowing through the pipeline.
///
/// Cloning a `Message` is cheap (it shares the same inner state via `Arc`)
/// but the pipeline never actually needs to clone one: ownership transfers
/// from source to worker to target, then the worker calls the terminal
/// `ack`/`nak` exactly once (spec §9, "Ownership & cycles").
pub struct Message {
    inner: Arc<MessageInner>,
}

impl Message {
    /// Wrap a source-specific message, snapshotting its data/metadata as
    /// the immutable "source" view.
    pub fn new(source: Box<dyn SourceMessage>) -> Result<Self> {
        let source_data = source.data()?;
        let source_metadata = source.metadata()?;
        Ok(Self {
            inner: Arc::new(MessageInner {
                source,
                source_data,
                source_metadata,
                current_data: RwLock::new(None),
                current_metadata: RwLock::new(HashMap::new()),
                filesystem: RwLock::new(None),
                ack_state: Mutex::new(AckState::Pending),
            }),
        })
    }

    /// Opaque id supplied by the source; need not be unique, may be empty.
    pub fn id(&self) -> &[u8] {
        self.inner.source.id()
    }

    /// Data a runner would see if nothing has replaced it yet.
    pub fn source_data(&self) -> &[u8] {
        &self.inner.source_data
    }

    /// Most recently written data, falling back to `source_data` (spec §8
    /// invariant 5: `current_data(m) = source_data(m)` iff no runner wrote).
    pub fn data(&self) -> Vec<u8> {
        self.inner
            .current_data
            .read()
            .clone()
            .unwrap_or_else(|| self.inner.source_data.clone())
    }

    /// Replace the current data. Subsequent readers (later runners, the
    /// target) observe this value.
    pub fn set_data(&self, data: impl Into<Vec<u8>>) {
        *self.inner.current_data.write() = Some(data.into());
    }

    /// `true` once some runner has replaced the data.
    pub fn data_was_written(&self) -> bool {
        self.inner.current_data.read().is_some()
    }

    /// Merged metadata: source keys overlaid by every runner write so far,
    /// last-write-wins per key (spec §8 invariant 4).
    pub fn metadata(&self) -> HashMap<String, String> {
        let mut merged = self.inner.source_metadata.clone();
        for (k, v) in self.inner.current_metadata.read().iter() {
            merged.insert(k.clone(), v.clone());
        }
        merged
    }

    /// Add or replace one metadata key. Runners may never delete a key,
    /// only add/replace (spec §3.1).
    pub fn set_metadata(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner
            .current_metadata
            .write()
            .insert(key.into(), value.into());
    }

    /// Merge a whole map in, last-write-wins per key.
    pub fn merge_metadata(&self, entries: impl IntoIterator<Item = (String, String)>) {
        let mut guard = self.inner.current_metadata.write();
        for (k, v) in entries {
            guard.insert(k, v);
        }
    }

    /// Filesystem view, creating a default virtual single-file view backed
    /// by `data()` on first access if none has been set (spec §3.1, §4.6).
    pub fn filesystem(&self) -> Arc<dyn Filesystem> {
        if let Some(fs) = self.inner.filesystem.read().clone() {
            return fs;
        }
        let mut guard = self.inner.filesystem.write();
        if let Some(fs) = guard.clone() {
            return fs;
        }
        let fs: Arc<dyn Filesystem> = self
            .inner
            .source
            .filesystem()
            .unwrap_or_else(|| Arc::new(SingleFileFs::new("/data", self.data())));
        *guard = Some(fs.clone());
        fs
    }

    /// Replace the filesystem view wholesale (a runner may do this, e.g.
    /// after unpacking a multipart body into an in-memory tree).
    pub fn set_filesystem(&self, fs: Arc<dyn Filesystem>) {
        *self.inner.filesystem.write() = Some(fs);
    }

    pub fn ack_state(&self) -> AckState {
        *self.inner.ack_state.lock()
    }

    /// Terminal positive transition, one-shot. A second call (from any
    /// clone of this `Message`) is a silent no-op, satisfying spec §8
    /// invariant 1.
    pub fn ack(&self, reply: Option<ReplyData>) -> Result<()> {
        let target_state = if reply.is_some() {
            AckState::Replied
        } else {
            AckState::Acked
        };
        if self.transition(target_state) {
            self.inner.source.ack(reply)?;
        }
        Ok(())
    }

    /// Terminal negative transition, one-shot.
    pub fn nak(&self) -> Result<()> {
        if self.transition(AckState::Nakked) {
            self.inner.source.nak()?;
        }
        Ok(())
    }

    /// Called by the source side once its per-message timer fires with no
    /// prior terminal call observed. Returns `true` if this call actually
    /// transitioned the state (i.e. no ack/nak/reply had landed yet).
    pub fn mark_timed_out(&self) -> bool {
        self.transition(AckState::TimedOut)
    }

    fn transition(&self, to: AckState) -> bool {
        let mut guard = self.inner.ack_state.lock();
        if guard.is_terminal() {
            return false;
        }
        *guard = to;
        true
    }
}

impl Clone for Message {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("id", &String::from_utf8_lossy(self.id()))
            .field("ack_state", &self.ack_state())
            .finish()
    }
}

/// Helper for connectors to surface the common "write" attempted error as
/// an `events_bridge_core::Error`.
pub fn permission_denied(op: &str, path: &str) -> Error {
    Error::PermissionError(format!("{op} denied on read-only path {path}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TestSourceMessage {
        id: Vec<u8>,
        data: Vec<u8>,
        metadata: HashMap<String, String>,
        ack_calls: Arc<AtomicUsize>,
        nak_calls: Arc<AtomicUsize>,
    }

    impl SourceMessage for TestSourceMessage {
        fn id(&self) -> &[u8] {
            &self.id
        }
        fn metadata(&self) -> Result<HashMap<String, String>> {
            Ok(self.metadata.clone())
        }
        fn data(&self) -> Result<Vec<u8>> {
            Ok(self.data.clone())
        }
        fn ack(&self, _reply: Option<ReplyData>) -> Result<()> {
            self.ack_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn nak(&self) -> Result<()> {
            self.nak_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn make_message(data: &str) -> (Message, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let ack_calls = Arc::new(AtomicUsize::new(0));
        let nak_calls = Arc::new(AtomicUsize::new(0));
        let src = TestSourceMessage {
            id: b"id-1".to_vec(),
            data: data.as_bytes().to_vec(),
            metadata: [("subject".to_string(), "ab.cd".to_string())].into(),
            ack_calls: ack_calls.clone(),
            nak_calls: nak_calls.clone(),
        };
        (Message::new(Box::new(src)).unwrap(), ack_calls, nak_calls)
    }

    #[test]
    fn data_falls_back_to_source_until_written() {
        let (msg, _, _) = make_message("ping");
        assert_eq!(msg.data(), b"ping");
        assert!(!msg.data_was_written());
        msg.set_data("pong");
        assert!(msg.data_was_written());
        assert_eq!(msg.data(), b"pong");
        assert_eq!(msg.source_data(), b"ping");
    }

    #[test]
    fn metadata_merge_is_last_write_wins() {
        let (msg, _, _) = make_message("x");
        msg.set_metadata("subject", "ee.ff");
        msg.set_metadata("extra", "1");
        let merged = msg.metadata();
        assert_eq!(merged.get("subject").unwrap(), "ee.ff");
        assert_eq!(merged.get("extra").unwrap(), "1");
    }

    #[test]
    fn ack_is_one_shot() {
        let (msg, ack_calls, nak_calls) = make_message("x");
        assert!(msg.ack(None).is_ok());
        assert!(msg.ack(None).is_ok());
        assert!(msg.nak().is_ok());
        assert_eq!(ack_calls.load(Ordering::SeqCst), 1);
        assert_eq!(nak_calls.load(Ordering::SeqCst), 0);
        assert_eq!(msg.ack_state(), AckState::Acked);
    }

    #[test]
    fn nak_is_one_shot_and_blocks_later_ack() {
        let (msg, ack_calls, nak_calls) = make_message("x");
        assert!(msg.nak().is_ok());
        assert!(msg.ack(None).is_ok());
        assert_eq!(nak_calls.load(Ordering::SeqCst), 1);
        assert_eq!(ack_calls.load(Ordering::SeqCst), 0);
        assert_eq!(msg.ack_state(), AckState::Nakked);
    }

    #[test]
    fn reply_transitions_to_replied() {
        let (msg, ack_calls, _) = make_message("x");
        msg.ack(Some(ReplyData::new("ok"))).unwrap();
        assert_eq!(msg.ack_state(), AckState::Replied);
        assert_eq!(ack_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn timeout_wins_only_if_nothing_else_landed_first() {
        let (msg, _, _) = make_message("x");
        assert!(msg.mark_timed_out());
        assert_eq!(msg.ack_state(), AckState::TimedOut);
        // A late ack is a no-op at the Message level.
        msg.ack(None).unwrap();
        assert_eq!(msg.ack_state(), AckState::TimedOut);
    }

    #[test]
    fn default_filesystem_is_single_file_backed_by_data() {
        let (msg, _, _) = make_message("payload");
        let fs = msg.filesystem();
        let mut file = fs.open("/data").unwrap();
        let mut buf = vec![0u8; 7];
        let n = file.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"payload");
    }
}
