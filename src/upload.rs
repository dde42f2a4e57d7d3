//! Chunked image upload over cloud events.
//!
//! The device announces a file with a `start` event, waits for the backend to
//! confirm it through the `camera` command, then streams `chunk` events. The
//! backend asks for missing chunks with `resend`, for a full retransmit with
//! `restart`, and closes the transfer with `done`.
//!
//! [`UploadSession`] is the device half, [`ImageAssembler`] the backend half.

use crate::config::BackendConfig;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use static_assertions::const_assert;
use std::collections::VecDeque;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CAMERA_EVENT: &str = "camera";
pub const CAMERA_COMMAND: &str = "camera";
pub const MAX_IMAGE_SIZE: usize = 1024 * 1024;
pub const MAX_CHUNK_SIZE: usize = 384;
/// JSON framing of a chunk event without its data.
const CHUNK_EVENT_OVERHEAD: usize = 96;
/// Keeps a resend request well inside the command argument limit.
const MAX_RESEND_CHUNKS: usize = 64;
pub const MAX_PENDING_CALLS: usize = 8;

const_assert!(MAX_CHUNK_SIZE * 2 + CHUNK_EVENT_OVERHEAD <= crate::cloud::MAX_EVENT_DATA_LEN);
const_assert!(MAX_RESEND_CHUNKS * 8 + 64 <= crate::dispatcher::MAX_ARGUMENT_LEN);

/// Upper bound on the serialized size of a chunk event carrying `chunk_size` bytes.
pub fn chunk_event_len(chunk_size: usize) -> usize {
    chunk_size.saturating_mul(2).saturating_add(CHUNK_EVENT_OVERHEAD)
}

pub fn image_digest(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Device → backend, published as the `camera` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum CameraEvent {
    Start {
        #[serde(rename = "fileNum")]
        file_num: u32,
        #[serde(rename = "chunkSize")]
        chunk_size: usize,
        #[serde(rename = "fileSize")]
        file_size: usize,
        hash: String,
    },
    Chunk {
        #[serde(rename = "fileNum")]
        file_num: u32,
        chunk: usize,
        data: String,
    },
}

/// Backend → device, delivered as the argument of the `camera` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum CameraRequest {
    Start {
        file: u32,
    },
    Resend {
        file: u32,
        chunks: Vec<usize>,
    },
    Restart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file: Option<u32>,
    },
    Done {
        file: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UploadError {
    #[error("request for file {got}, active file is {expected}")]
    FileMismatch { expected: u32, got: u32 },
    #[error("chunk {chunk} out of range ({num_chunks} chunks)")]
    ChunkOutOfRange { chunk: usize, num_chunks: usize },
    #[error("chunk data is not valid hex")]
    InvalidChunkData,
    #[error("invalid start: chunk size {chunk_size}, file size {file_size}")]
    InvalidStart { chunk_size: usize, file_size: usize },
    #[error("invalid event payload: {0}")]
    InvalidPayload(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferProgress {
    Streaming,
    Resending(usize),
    Restarted,
    Finished,
}

fn num_chunks(file_size: usize, chunk_size: usize) -> usize {
    file_size.div_ceil(chunk_size)
}

/// Device side of one file transfer.
#[derive(Debug, Clone)]
pub struct UploadSession {
    file_num: u32,
    image: Vec<u8>,
    chunk_size: usize,
    hash: String,
    ack_timeout_ms: u64,
    start_acked: bool,
    start_sent_at: Option<u64>,
    start_attempts: u8,
    next_chunk: usize,
    resend: VecDeque<usize>,
    last_activity_ms: u64,
    finished: bool,
}

impl UploadSession {
    pub fn new(file_num: u32, image: Vec<u8>, chunk_size: usize, ack_timeout_ms: u64, now_ms: u64) -> Self {
        debug_assert!(chunk_size > 0, "chunk size must be non-zero");
        let hash = image_digest(&image);
        Self {
            file_num,
            image,
            chunk_size: chunk_size.clamp(1, MAX_CHUNK_SIZE),
            hash,
            ack_timeout_ms,
            start_acked: false,
            start_sent_at: None,
            start_attempts: 0,
            next_chunk: 0,
            resend: VecDeque::new(),
            last_activity_ms: now_ms,
            finished: false,
        }
    }

    pub fn file_num(&self) -> u32 {
        self.file_num
    }

    pub fn num_chunks(&self) -> usize {
        num_chunks(self.image.len(), self.chunk_size)
    }

    pub fn start_attempts(&self) -> u8 {
        self.start_attempts
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn is_start_acked(&self) -> bool {
        self.start_acked
    }

    /// No backend traffic for `timeout_ms` after everything was sent.
    pub fn is_stalled(&self, now_ms: u64, timeout_ms: u64) -> bool {
        self.start_acked
            && self.resend.is_empty()
            && self.next_chunk >= self.num_chunks()
            && now_ms.saturating_sub(self.last_activity_ms) >= timeout_ms
    }

    pub fn start_event(&self) -> CameraEvent {
        CameraEvent::Start {
            file_num: self.file_num,
            chunk_size: self.chunk_size,
            file_size: self.image.len(),
            hash: self.hash.clone(),
        }
    }

    pub fn chunk_event(&self, chunk: usize) -> Option<CameraEvent> {
        let start = chunk.checked_mul(self.chunk_size)?;
        if start >= self.image.len() {
            return None;
        }
        let end = (start + self.chunk_size).min(self.image.len());
        Some(CameraEvent::Chunk {
            file_num: self.file_num,
            chunk,
            data: hex::encode(&self.image[start..end]),
        })
    }

    /// The event that should go out next, if any. Nothing changes until
    /// [`mark_sent`](Self::mark_sent) confirms the publish.
    pub fn pending_event(&self, now_ms: u64) -> Option<CameraEvent> {
        if self.finished {
            return None;
        }
        if !self.start_acked {
            let due = self
                .start_sent_at
                .is_none_or(|sent| now_ms.saturating_sub(sent) >= self.ack_timeout_ms);
            return due.then(|| self.start_event());
        }
        if let Some(&chunk) = self.resend.front() {
            return self.chunk_event(chunk);
        }
        self.chunk_event(self.next_chunk)
    }

    pub fn mark_sent(&mut self, event: &CameraEvent, now_ms: u64) {
        self.last_activity_ms = now_ms;
        match event {
            CameraEvent::Start { .. } => {
                self.start_sent_at = Some(now_ms);
                self.start_attempts = self.start_attempts.saturating_add(1);
            }
            CameraEvent::Chunk { chunk, .. } => {
                if self.resend.front() == Some(chunk) {
                    self.resend.pop_front();
                } else if *chunk == self.next_chunk {
                    self.next_chunk += 1;
                }
            }
        }
    }

    pub fn apply(&mut self, request: &CameraRequest, now_ms: u64) -> Result<TransferProgress, UploadError> {
        let file = match request {
            CameraRequest::Start { file }
            | CameraRequest::Resend { file, .. }
            | CameraRequest::Done { file } => Some(*file),
            CameraRequest::Restart { file } => *file,
        };
        if let Some(file) = file {
            if file != self.file_num {
                return Err(UploadError::FileMismatch {
                    expected: self.file_num,
                    got: file,
                });
            }
        }
        self.last_activity_ms = now_ms;

        match request {
            CameraRequest::Start { .. } => {
                self.start_acked = true;
                Ok(TransferProgress::Streaming)
            }
            CameraRequest::Resend { chunks, .. } => {
                let total = self.num_chunks();
                // A resend implies the backend saw the start
                self.start_acked = true;
                for &chunk in chunks {
                    if chunk < total && !self.resend.contains(&chunk) {
                        self.resend.push_back(chunk);
                    }
                }
                Ok(TransferProgress::Resending(self.resend.len()))
            }
            CameraRequest::Restart { .. } => {
                self.start_acked = false;
                self.start_sent_at = None;
                self.start_attempts = 0;
                self.next_chunk = 0;
                self.resend.clear();
                Ok(TransferProgress::Restarted)
            }
            CameraRequest::Done { .. } => {
                self.finished = true;
                Ok(TransferProgress::Finished)
            }
        }
    }
}

/// A fully received, hash-verified image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletedImage {
    pub file_num: u32,
    pub file_name: String,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    /// Most recent `loc` payload seen when the transfer started.
    pub location: Option<serde_json::Value>,
}

#[derive(Debug, Default, PartialEq)]
pub struct AssemblyOutcome {
    pub requests: Vec<CameraRequest>,
    pub completed: Option<CompletedImage>,
}

#[derive(Debug)]
struct Transfer {
    file_num: u32,
    chunk_size: usize,
    hash: String,
    data: Vec<u8>,
    received: Vec<bool>,
    location: Option<serde_json::Value>,
    last_chunk_ms: u64,
    restart_at_ms: Option<u64>,
}

impl Transfer {
    fn missing_chunks(&self) -> Vec<usize> {
        self.received
            .iter()
            .enumerate()
            .filter(|(_, received)| !**received)
            .map(|(chunk, _)| chunk)
            .collect()
    }
}

/// Backend side: reassembles one device's image from its event stream.
#[derive(Debug)]
pub struct ImageAssembler {
    config: BackendConfig,
    transfer: Option<Transfer>,
    last_location: Option<serde_json::Value>,
}

impl ImageAssembler {
    pub fn new(config: BackendConfig) -> Self {
        Self {
            config,
            transfer: None,
            last_location: None,
        }
    }

    pub fn on_location(&mut self, data: &str) -> Result<(), UploadError> {
        let value = serde_json::from_str(data).map_err(|e| UploadError::InvalidPayload(e.to_string()))?;
        self.last_location = Some(value);
        Ok(())
    }

    pub fn on_camera_data(&mut self, data: &str, now_ms: u64) -> Result<AssemblyOutcome, UploadError> {
        let event: CameraEvent =
            serde_json::from_str(data).map_err(|e| UploadError::InvalidPayload(e.to_string()))?;
        self.on_camera_event(event, now_ms)
    }

    pub fn on_camera_event(&mut self, event: CameraEvent, now_ms: u64) -> Result<AssemblyOutcome, UploadError> {
        match event {
            CameraEvent::Start {
                file_num,
                chunk_size,
                file_size,
                hash,
            } => self.on_start(file_num, chunk_size, file_size, hash, now_ms),
            CameraEvent::Chunk { file_num, chunk, data } => self.on_chunk(file_num, chunk, &data, now_ms),
        }
    }

    fn on_start(
        &mut self,
        file_num: u32,
        chunk_size: usize,
        file_size: usize,
        hash: String,
        now_ms: u64,
    ) -> Result<AssemblyOutcome, UploadError> {
        if chunk_size == 0 || file_size == 0 || file_size > MAX_IMAGE_SIZE {
            return Err(UploadError::InvalidStart { chunk_size, file_size });
        }

        let chunks = num_chunks(file_size, chunk_size);
        info!(
            target: "app.cam",
            "receiving file {} ({} bytes, {} chunks)",
            file_num, file_size, chunks
        );
        self.transfer = Some(Transfer {
            file_num,
            chunk_size,
            hash,
            data: vec![0; file_size],
            received: vec![false; chunks],
            location: self.last_location.take(),
            last_chunk_ms: now_ms,
            restart_at_ms: None,
        });

        Ok(AssemblyOutcome {
            requests: vec![CameraRequest::Start { file: file_num }],
            completed: None,
        })
    }

    fn on_chunk(&mut self, file_num: u32, chunk: usize, data: &str, now_ms: u64) -> Result<AssemblyOutcome, UploadError> {
        let Some(transfer) = self.transfer.as_mut().filter(|t| t.file_num == file_num) else {
            warn!(target: "app.cam", "chunk for unexpected file {}, requesting restart", file_num);
            return Ok(AssemblyOutcome {
                requests: vec![CameraRequest::Restart { file: None }],
                completed: None,
            });
        };

        let num_chunks = transfer.received.len();
        if chunk >= num_chunks {
            return Err(UploadError::ChunkOutOfRange { chunk, num_chunks });
        }
        let bytes = hex::decode(data).map_err(|_| UploadError::InvalidChunkData)?;

        let offset = chunk * transfer.chunk_size;
        let end = (offset + bytes.len()).min(transfer.data.len());
        transfer.data[offset..end].copy_from_slice(&bytes[..end - offset]);
        transfer.received[chunk] = true;
        transfer.last_chunk_ms = now_ms;

        if transfer.received.iter().any(|received| !received) {
            return Ok(AssemblyOutcome::default());
        }

        let digest = image_digest(&transfer.data);
        if digest != transfer.hash {
            warn!(
                target: "app.cam",
                "hash mismatch on file {} expected={} got={}",
                file_num, transfer.hash, digest
            );
            // Duplicate chunks must not push back a restart already scheduled
            if transfer.restart_at_ms.is_none() {
                transfer.restart_at_ms = Some(now_ms + self.config.restart_delay_ms);
            }
            return Ok(AssemblyOutcome::default());
        }

        let Some(transfer) = self.transfer.take() else {
            return Ok(AssemblyOutcome::default());
        };
        info!(target: "app.cam", "file {} complete ({} bytes)", file_num, transfer.data.len());
        Ok(AssemblyOutcome {
            requests: vec![CameraRequest::Done { file: file_num }],
            completed: Some(CompletedImage {
                file_num,
                file_name: format!("{:05}.jpg", file_num),
                data: transfer.data,
                location: transfer.location,
            }),
        })
    }

    /// Timer-driven requests: delayed restart after a hash mismatch, or a resend
    /// when chunks are missing and the stream has gone quiet.
    pub fn poll(&mut self, now_ms: u64) -> Option<CameraRequest> {
        let transfer = self.transfer.as_mut()?;

        if let Some(restart_at) = transfer.restart_at_ms {
            if now_ms < restart_at {
                return None;
            }
            transfer.restart_at_ms = None;
            transfer.received.iter_mut().for_each(|received| *received = false);
            transfer.last_chunk_ms = now_ms;
            debug!(target: "app.cam", "requesting restart of file {}", transfer.file_num);
            return Some(CameraRequest::Restart {
                file: Some(transfer.file_num),
            });
        }

        if now_ms.saturating_sub(transfer.last_chunk_ms) < self.config.resend_after_ms {
            return None;
        }
        let mut missing = transfer.missing_chunks();
        if missing.is_empty() {
            return None;
        }
        missing.truncate(MAX_RESEND_CHUNKS);
        transfer.last_chunk_ms = now_ms;
        debug!(
            target: "app.cam",
            "requesting {} missing chunks of file {}",
            missing.len(),
            transfer.file_num
        );
        Some(CameraRequest::Resend {
            file: transfer.file_num,
            chunks: missing,
        })
    }

    pub fn missing_chunks(&self) -> Vec<usize> {
        self.transfer.as_ref().map(Transfer::missing_chunks).unwrap_or_default()
    }

    pub fn active_file(&self) -> Option<u32> {
        self.transfer.as_ref().map(|t| t.file_num)
    }
}

/// Backend requests whose delivery failed, re-sent after `call_retry_ms`.
///
/// Entries come out in the order they were deferred. When full, the oldest entry
/// is dropped.
#[derive(Debug)]
pub struct CallRetryQueue {
    retry_after_ms: u64,
    pending: heapless::Deque<(u64, CameraRequest), MAX_PENDING_CALLS>,
    dropped: u32,
}

impl CallRetryQueue {
    pub fn new(retry_after_ms: u64) -> Self {
        Self {
            retry_after_ms,
            pending: heapless::Deque::new(),
            dropped: 0,
        }
    }

    pub fn defer(&mut self, request: CameraRequest, now_ms: u64) {
        if self.pending.is_full() {
            if let Some((_, stale)) = self.pending.pop_front() {
                warn!(target: "app.cloud", "retry queue full, dropping {:?}", stale);
            }
            self.dropped = self.dropped.saturating_add(1);
        }
        let due = now_ms.saturating_add(self.retry_after_ms);
        if self.pending.push_back((due, request)).is_err() {
            warn!(target: "app.cloud", "retry queue rejected request");
            return;
        }
        debug!(target: "app.cloud", "camera call retry in {} ms", self.retry_after_ms);
    }

    /// Requests whose retry time has come, oldest first.
    pub fn take_due(&mut self, now_ms: u64) -> Vec<CameraRequest> {
        let mut due = Vec::new();
        while self.pending.front().is_some_and(|(at, _)| *at <= now_ms) {
            if let Some((_, request)) = self.pending.pop_front() {
                due.push(request);
            }
        }
        due
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn dropped(&self) -> u32 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_image(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 251) as u8).collect()
    }

    fn backend() -> ImageAssembler {
        ImageAssembler::new(BackendConfig {
            resend_after_ms: 1_000,
            restart_delay_ms: 500,
            call_retry_ms: 2_000,
        })
    }

    #[test]
    fn test_wire_format() {
        let event = CameraEvent::Start {
            file_num: 3,
            chunk_size: 256,
            file_size: 1000,
            hash: "ab".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["op"], "start");
        assert_eq!(json["fileNum"], 3);
        assert_eq!(json["chunkSize"], 256);
        assert_eq!(json["fileSize"], 1000);

        let request: CameraRequest = serde_json::from_str(r#"{"op":"resend","file":3,"chunks":[1,4]}"#).unwrap();
        assert_eq!(
            request,
            CameraRequest::Resend {
                file: 3,
                chunks: vec![1, 4]
            }
        );

        let restart: CameraRequest = serde_json::from_str(r#"{"op":"restart"}"#).unwrap();
        assert_eq!(restart, CameraRequest::Restart { file: None });
        assert_eq!(serde_json::to_string(&restart).unwrap(), r#"{"op":"restart"}"#);
    }

    #[test]
    fn test_chunk_event_fits_event_limit() {
        let session = UploadSession::new(1, vec![0xFF; MAX_CHUNK_SIZE * 2], MAX_CHUNK_SIZE, 1_000, 0);
        let event = session.chunk_event(1).unwrap();
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.len() <= chunk_event_len(MAX_CHUNK_SIZE));
        assert!(json.len() <= crate::cloud::MAX_EVENT_DATA_LEN);
    }

    #[test]
    fn test_session_waits_for_start_ack() {
        let mut session = UploadSession::new(1, test_image(600), 256, 1_000, 0);
        assert_eq!(session.num_chunks(), 3);

        let start = session.pending_event(0).unwrap();
        assert!(matches!(start, CameraEvent::Start { .. }));
        session.mark_sent(&start, 0);

        // No chunks before the backend confirms, start repeats after the ack timeout
        assert_eq!(session.pending_event(500), None);
        assert!(matches!(session.pending_event(1_000), Some(CameraEvent::Start { .. })));

        session.apply(&CameraRequest::Start { file: 1 }, 1_100).unwrap();
        assert!(matches!(
            session.pending_event(1_100),
            Some(CameraEvent::Chunk { chunk: 0, .. })
        ));
    }

    #[test]
    fn test_session_resend_takes_priority() {
        let mut session = UploadSession::new(2, test_image(1024), 256, 1_000, 0);
        session.apply(&CameraRequest::Start { file: 2 }, 0).unwrap();

        for expected in 0..4 {
            let event = session.pending_event(0).unwrap();
            assert!(matches!(event, CameraEvent::Chunk { chunk, .. } if chunk == expected));
            session.mark_sent(&event, 0);
        }
        assert_eq!(session.pending_event(0), None);

        let progress = session
            .apply(&CameraRequest::Resend { file: 2, chunks: vec![2, 9, 2] }, 0)
            .unwrap();
        assert_eq!(progress, TransferProgress::Resending(1));
        let event = session.pending_event(0).unwrap();
        assert!(matches!(event, CameraEvent::Chunk { chunk: 2, .. }));
        session.mark_sent(&event, 0);
        assert_eq!(session.pending_event(0), None);
    }

    #[test]
    fn test_session_rejects_other_file() {
        let mut session = UploadSession::new(5, test_image(10), 4, 1_000, 0);
        assert_eq!(
            session.apply(&CameraRequest::Done { file: 6 }, 0),
            Err(UploadError::FileMismatch { expected: 5, got: 6 })
        );
        assert!(!session.is_finished());
        assert_eq!(session.apply(&CameraRequest::Done { file: 5 }, 0), Ok(TransferProgress::Finished));
        assert!(session.is_finished());
        assert_eq!(session.pending_event(0), None);
    }

    #[test]
    fn test_session_stall_detection() {
        let mut session = UploadSession::new(1, test_image(8), 8, 1_000, 0);
        session.apply(&CameraRequest::Start { file: 1 }, 0).unwrap();
        let chunk = session.pending_event(10).unwrap();
        session.mark_sent(&chunk, 10);

        assert!(!session.is_stalled(500, 1_000));
        assert!(session.is_stalled(1_010, 1_000));
    }

    /// Pump events from the session into the assembler and requests back.
    fn run_transfer(session: &mut UploadSession, assembler: &mut ImageAssembler, drop_chunk: Option<usize>) -> Option<CompletedImage> {
        let mut now = 0;
        let mut dropped = false;
        for _ in 0..200 {
            now += 10;
            let mut requests = Vec::new();
            if let Some(event) = session.pending_event(now) {
                session.mark_sent(&event, now);
                let lost = matches!(event, CameraEvent::Chunk { chunk, .. } if Some(chunk) == drop_chunk && !dropped);
                if lost {
                    dropped = true;
                } else {
                    let outcome = assembler.on_camera_event(event, now).unwrap();
                    if outcome.completed.is_some() {
                        for request in &outcome.requests {
                            session.apply(request, now).unwrap();
                        }
                        return outcome.completed;
                    }
                    requests.extend(outcome.requests);
                }
            }
            if let Some(request) = assembler.poll(now) {
                requests.push(request);
            }
            for request in requests {
                session.apply(&request, now).unwrap();
            }
        }
        None
    }

    #[test]
    fn test_end_to_end_transfer() {
        let image = test_image(1000);
        let mut session = UploadSession::new(7, image.clone(), 256, 5_000, 0);
        let mut assembler = backend();
        assembler.on_location(r#"{"loc":{"lat":1.0}}"#).unwrap();

        let completed = run_transfer(&mut session, &mut assembler, None).unwrap();
        assert_eq!(completed.data, image);
        assert_eq!(completed.file_name, "00007.jpg");
        assert!(completed.location.is_some());
        assert!(session.is_finished());
        assert_eq!(assembler.active_file(), None);
    }

    #[test]
    fn test_lost_chunk_is_resent() {
        let image = test_image(1000);
        let mut session = UploadSession::new(8, image.clone(), 256, 5_000, 0);
        let mut assembler = backend();

        let completed = run_transfer(&mut session, &mut assembler, Some(1)).unwrap();
        assert_eq!(completed.data, image);
    }

    #[test]
    fn test_chunk_for_unknown_file_requests_restart() {
        let mut assembler = backend();
        let outcome = assembler
            .on_camera_event(
                CameraEvent::Chunk {
                    file_num: 4,
                    chunk: 0,
                    data: "00".into(),
                },
                0,
            )
            .unwrap();
        assert_eq!(outcome.requests, vec![CameraRequest::Restart { file: None }]);
    }

    #[test]
    fn test_hash_mismatch_schedules_restart() {
        let mut assembler = backend();
        assembler
            .on_camera_event(
                CameraEvent::Start {
                    file_num: 1,
                    chunk_size: 4,
                    file_size: 4,
                    hash: image_digest(b"good"),
                },
                0,
            )
            .unwrap();
        let outcome = assembler
            .on_camera_event(
                CameraEvent::Chunk {
                    file_num: 1,
                    chunk: 0,
                    data: hex::encode(b"bad!"),
                },
                100,
            )
            .unwrap();
        assert_eq!(outcome, AssemblyOutcome::default());

        assert_eq!(assembler.poll(200), None);
        assert_eq!(assembler.poll(600), Some(CameraRequest::Restart { file: Some(1) }));
        assert_eq!(assembler.missing_chunks(), vec![0]);
    }

    #[test]
    fn test_duplicate_chunk_keeps_restart_deadline() {
        let mut assembler = backend();
        assembler
            .on_camera_event(
                CameraEvent::Start {
                    file_num: 1,
                    chunk_size: 4,
                    file_size: 4,
                    hash: image_digest(b"good"),
                },
                0,
            )
            .unwrap();
        let bad_chunk = CameraEvent::Chunk {
            file_num: 1,
            chunk: 0,
            data: hex::encode(b"bad!"),
        };
        assembler.on_camera_event(bad_chunk.clone(), 100).unwrap();
        assembler.on_camera_event(bad_chunk, 400).unwrap();

        assert_eq!(assembler.poll(599), None);
        assert_eq!(assembler.poll(600), Some(CameraRequest::Restart { file: Some(1) }));
    }

    #[test]
    fn test_rejects_bad_chunks() {
        let mut assembler = backend();
        assembler
            .on_camera_event(
                CameraEvent::Start {
                    file_num: 1,
                    chunk_size: 4,
                    file_size: 8,
                    hash: String::new(),
                },
                0,
            )
            .unwrap();

        let out_of_range = assembler.on_camera_event(
            CameraEvent::Chunk {
                file_num: 1,
                chunk: 2,
                data: "00".into(),
            },
            0,
        );
        assert_eq!(
            out_of_range,
            Err(UploadError::ChunkOutOfRange { chunk: 2, num_chunks: 2 })
        );

        let bad_hex = assembler.on_camera_event(
            CameraEvent::Chunk {
                file_num: 1,
                chunk: 0,
                data: "zz".into(),
            },
            0,
        );
        assert_eq!(bad_hex, Err(UploadError::InvalidChunkData));

        let bad_start = assembler.on_camera_event(
            CameraEvent::Start {
                file_num: 2,
                chunk_size: 0,
                file_size: 8,
                hash: String::new(),
            },
            0,
        );
        assert!(matches!(bad_start, Err(UploadError::InvalidStart { .. })));
    }

    #[test]
    fn test_failed_call_retried_after_delay() {
        let mut retries = CallRetryQueue::new(20_000);
        retries.defer(CameraRequest::Done { file: 4 }, 1_000);
        retries.defer(CameraRequest::Start { file: 5 }, 3_000);

        assert!(retries.take_due(20_999).is_empty());
        assert_eq!(retries.take_due(21_000), vec![CameraRequest::Done { file: 4 }]);
        assert_eq!(retries.len(), 1);
        assert_eq!(retries.take_due(30_000), vec![CameraRequest::Start { file: 5 }]);
        assert!(retries.is_empty());
    }

    #[test]
    fn test_retry_queue_drops_oldest_when_full() {
        let mut retries = CallRetryQueue::new(10);
        for file in 0..=MAX_PENDING_CALLS as u32 {
            retries.defer(CameraRequest::Done { file }, 0);
        }

        assert_eq!(retries.dropped(), 1);
        let due = retries.take_due(10);
        assert_eq!(due.len(), MAX_PENDING_CALLS);
        assert_eq!(due[0], CameraRequest::Done { file: 1 });
    }
}
