//! Asynchronous, bounded-buffer evidence recorder.
//!
//! Submission never blocks the request path: a full queue increments a
//! dropped-submissions counter and returns immediately. A dedicated writer
//! task drains the queue, hashes and signs each record, and writes it
//! through the configured storage backend.

use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, warn};
use uuid::Uuid;

use crate::evidence::record::{EvidenceSigner, HashInputs};
use crate::evidence::storage::EvidenceStorage;
use crate::model::{CompletionResponse, EnrichedRequest, PolicyDecision};

/// Tunables for the recorder, mirroring the `evidence.recorder.*` config surface.
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Depth of the bounded submission queue.
    pub buffer_size: usize,
    /// Deadline for one write through the storage backend.
    pub write_timeout: Duration,
    /// Whether to compute and store the request hash.
    pub hash_request: bool,
    /// Whether to compute and store the response hash.
    pub hash_response: bool,
    /// Whether to redact the API-key id before storing.
    pub redact_api_keys: bool,
    /// Maximum length for clamped string fields.
    pub max_field_length: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1024,
            write_timeout: Duration::from_secs(5),
            hash_request: true,
            hash_response: true,
            redact_api_keys: false,
            max_field_length: 4096,
        }
    }
}

/// One request's worth of material submitted to the recorder.
pub struct Submission {
    /// The enriched request as the pipeline saw it.
    pub enriched: EnrichedRequest,
    /// The policy decision made for this request.
    pub decision: PolicyDecision,
    /// Successful response, if any.
    pub response: Option<CompletionResponse>,
    /// Error description, if the request failed.
    pub error: Option<String>,
    /// Provider the request was routed to.
    pub provider: String,
    /// Actual cost incurred.
    pub actual_cost: f64,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    dropped: AtomicU64,
    written: AtomicU64,
    write_errors: AtomicU64,
}

/// Point-in-time snapshot of recorder counters.
#[derive(Debug, Clone, Default)]
pub struct RecorderStats {
    /// Submissions accepted onto the queue.
    pub submitted: u64,
    /// Submissions dropped because the queue was full.
    pub dropped: u64,
    /// Records successfully written to storage.
    pub written: u64,
    /// Writes that failed.
    pub write_errors: u64,
}

/// Drives the bounded submission queue and the background writer task.
pub struct EvidenceRecorder {
    tx: Mutex<Option<mpsc::Sender<Submission>>>,
    counters: Arc<Counters>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl EvidenceRecorder {
    /// Start a recorder backed by `storage`, signing every record with `signer`.
    #[must_use]
    pub fn start(
        config: RecorderConfig,
        storage: Arc<dyn EvidenceStorage>,
        signer: Arc<EvidenceSigner>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.buffer_size);
        let counters = Arc::new(Counters::default());
        let writer_counters = Arc::clone(&counters);
        let handle = tokio::spawn(writer_loop(rx, storage, signer, config, writer_counters));

        Self {
            tx: Mutex::new(Some(tx)),
            counters,
            writer: Mutex::new(Some(handle)),
        }
    }

    /// Submit a record. Never blocks: if the queue is full, increments the
    /// dropped counter and returns immediately.
    pub async fn submit(&self, submission: Submission) {
        let guard = self.tx.lock().await;
        let Some(tx) = guard.as_ref() else {
            self.counters.dropped.fetch_add(1, Relaxed);
            return;
        };
        match tx.try_send(submission) {
            Ok(()) => {
                self.counters.submitted.fetch_add(1, Relaxed);
            }
            Err(_) => {
                self.counters.dropped.fetch_add(1, Relaxed);
            }
        }
    }

    /// Snapshot the recorder's counters.
    #[must_use]
    pub fn stats(&self) -> RecorderStats {
        RecorderStats {
            submitted: self.counters.submitted.load(Relaxed),
            dropped: self.counters.dropped.load(Relaxed),
            written: self.counters.written.load(Relaxed),
            write_errors: self.counters.write_errors.load(Relaxed),
        }
    }

    /// Stop accepting new submissions and wait up to `deadline` for the
    /// writer to drain the remaining queue.
    pub async fn close(&self, deadline: Duration) {
        self.tx.lock().await.take();

        let handle = self.writer.lock().await.take();
        if let Some(handle) = handle {
            if tokio::time::timeout(deadline, handle).await.is_err() {
                warn!("evidence recorder writer did not drain within deadline");
            }
        }
    }
}

async fn writer_loop(
    mut rx: mpsc::Receiver<Submission>,
    storage: Arc<dyn EvidenceStorage>,
    signer: Arc<EvidenceSigner>,
    config: RecorderConfig,
    counters: Arc<Counters>,
) {
    while let Some(submission) = rx.recv().await {
        let record = build_record(&submission, &signer, &config);
        let write = storage.store(record);
        match tokio::time::timeout(config.write_timeout, write).await {
            Ok(Ok(())) => {
                counters.written.fetch_add(1, Relaxed);
            }
            Ok(Err(e)) => {
                counters.write_errors.fetch_add(1, Relaxed);
                error!(error = %e, "evidence write failed");
            }
            Err(_) => {
                counters.write_errors.fetch_add(1, Relaxed);
                error!("evidence write timed out");
            }
        }
    }
}

fn clamp(field: &str, max_len: usize) -> String {
    if field.len() > max_len {
        field.chars().take(max_len).collect()
    } else {
        field.to_owned()
    }
}

fn build_record(
    submission: &Submission,
    signer: &EvidenceSigner,
    config: &RecorderConfig,
) -> crate::model::EvidenceRecord {
    let api_key_id = if config.redact_api_keys {
        "[REDACTED]".to_owned()
    } else {
        clamp(&submission.enriched.api_key_id, config.max_field_length)
    };

    let request_hash = if config.hash_request {
        HashInputs::hash_request(&submission.enriched.request)
    } else {
        String::new()
    };

    let response_hash = submission
        .response
        .as_ref()
        .map(|r| {
            if config.hash_response {
                HashInputs::hash_response(r)
            } else {
                String::new()
            }
        })
        .unwrap_or_default();

    let (prompt_tokens, completion_tokens, total_tokens) = submission
        .response
        .as_ref()
        .map(|r| (r.usage.prompt_tokens, r.usage.completion_tokens, r.usage.total_tokens))
        .unwrap_or((0, 0, 0));

    let mut record = crate::model::EvidenceRecord {
        id: Uuid::new_v4().to_string(),
        request_timestamp: chrono::Utc::now(),
        user_id: clamp(&submission.enriched.user, config.max_field_length),
        api_key_id,
        model: clamp(&submission.enriched.request.model, config.max_field_length),
        provider: clamp(&submission.provider, config.max_field_length),
        policy_decision: submission.decision.action,
        block_reason: submission
            .decision
            .block_reason
            .as_ref()
            .map(|r| clamp(r, config.max_field_length)),
        policy_version: clamp(&submission.decision.policy_version, config.max_field_length),
        prompt_tokens,
        completion_tokens,
        total_tokens,
        actual_cost: submission.actual_cost,
        request_hash,
        response_hash,
        signature: String::new(),
        signing_key_id: signer.key_id().to_owned(),
    };

    record.signature = signer.sign(&record);
    record
}
