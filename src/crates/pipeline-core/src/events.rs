//! Engine event sink
//!
//! The engine reports progress through the narrow [`EventSink`] interface;
//! the transport (server-sent events, a pub/sub bus, a websocket fanout) is
//! the embedder's choice. [`LogEventSink`] only traces; [`ChannelEventSink`]
//! pushes typed events into a bounded channel for a streaming frontend.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// A single engine event, timestamped at emission
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    JobStart {
        job_id: String,
        total_steps: usize,
        timestamp: String,
    },
    StepStart {
        job_id: String,
        step: String,
        timestamp: String,
    },
    StepComplete {
        job_id: String,
        step: String,
        duration_ms: i64,
        timestamp: String,
    },
    StepError {
        job_id: String,
        step: String,
        error: String,
        timestamp: String,
    },
    JobComplete {
        job_id: String,
        output_url: String,
        duration_ms: i64,
        timestamp: String,
    },
    JobError {
        job_id: String,
        error: String,
        step: Option<String>,
        timestamp: String,
    },
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Narrow sink interface the engine emits through
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn job_start(&self, job_id: &str, total_steps: usize);
    async fn step_start(&self, job_id: &str, step: &str);
    async fn step_complete(&self, job_id: &str, step: &str, duration_ms: i64);
    async fn step_error(&self, job_id: &str, step: &str, error: &str);
    async fn job_complete(&self, job_id: &str, output_url: &str, duration_ms: i64);
    async fn job_error(&self, job_id: &str, error: &str, step: Option<&str>);
}

/// Sink that only writes tracing records
#[derive(Debug, Clone, Copy, Default)]
pub struct LogEventSink;

#[async_trait]
impl EventSink for LogEventSink {
    async fn job_start(&self, job_id: &str, total_steps: usize) {
        info!(job_id = %job_id, total_steps, "Job started");
    }

    async fn step_start(&self, job_id: &str, step: &str) {
        info!(job_id = %job_id, step = %step, "Step started");
    }

    async fn step_complete(&self, job_id: &str, step: &str, duration_ms: i64) {
        info!(job_id = %job_id, step = %step, duration_ms, "Step complete");
    }

    async fn step_error(&self, job_id: &str, step: &str, error: &str) {
        error!(job_id = %job_id, step = %step, error = %error, "Step error");
    }

    async fn job_complete(&self, job_id: &str, output_url: &str, duration_ms: i64) {
        info!(job_id = %job_id, output_url = %output_url, duration_ms, "Job complete");
    }

    async fn job_error(&self, job_id: &str, error: &str, step: Option<&str>) {
        error!(job_id = %job_id, error = %error, step = ?step, "Job error");
    }
}

/// Sink that pushes events into a bounded mpsc channel.
///
/// Send failures (receiver dropped, buffer gone) are logged and swallowed:
/// event delivery must never affect pipeline execution.
#[derive(Clone)]
pub struct ChannelEventSink {
    sender: mpsc::Sender<PipelineEvent>,
}

impl ChannelEventSink {
    /// Create a sink and the receiving half for the transport task
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<PipelineEvent>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { sender: tx }, rx)
    }

    async fn emit(&self, event: PipelineEvent) {
        if let Err(e) = self.sender.send(event).await {
            warn!(error = %e, "Event receiver dropped, discarding event");
        }
    }
}

#[async_trait]
impl EventSink for ChannelEventSink {
    async fn job_start(&self, job_id: &str, total_steps: usize) {
        self.emit(PipelineEvent::JobStart {
            job_id: job_id.to_string(),
            total_steps,
            timestamp: now(),
        })
        .await;
    }

    async fn step_start(&self, job_id: &str, step: &str) {
        self.emit(PipelineEvent::StepStart {
            job_id: job_id.to_string(),
            step: step.to_string(),
            timestamp: now(),
        })
        .await;
    }

    async fn step_complete(&self, job_id: &str, step: &str, duration_ms: i64) {
        self.emit(PipelineEvent::StepComplete {
            job_id: job_id.to_string(),
            step: step.to_string(),
            duration_ms,
            timestamp: now(),
        })
        .await;
    }

    async fn step_error(&self, job_id: &str, step: &str, error: &str) {
        self.emit(PipelineEvent::StepError {
            job_id: job_id.to_string(),
            step: step.to_string(),
            error: error.to_string(),
            timestamp: now(),
        })
        .await;
    }

    async fn job_complete(&self, job_id: &str, output_url: &str, duration_ms: i64) {
        self.emit(PipelineEvent::JobComplete {
            job_id: job_id.to_string(),
            output_url: output_url.to_string(),
            duration_ms,
            timestamp: now(),
        })
        .await;
    }

    async fn job_error(&self, job_id: &str, error: &str, step: Option<&str>) {
        self.emit(PipelineEvent::JobError {
            job_id: job_id.to_string(),
            error: error.to_string(),
            step: step.map(String::from),
            timestamp: now(),
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_sink_delivers_in_order() {
        let (sink, mut rx) = ChannelEventSink::new(16);
        sink.job_start("job-1", 3).await;
        sink.step_start("job-1", "TRANSCRIBE").await;
        sink.step_complete("job-1", "TRANSCRIBE", 1500).await;

        match rx.recv().await.unwrap() {
            PipelineEvent::JobStart { total_steps, .. } => assert_eq!(total_steps, 3),
            other => panic!("unexpected event: {:?}", other),
        }
        match rx.recv().await.unwrap() {
            PipelineEvent::StepStart { step, .. } => assert_eq!(step, "TRANSCRIBE"),
            other => panic!("unexpected event: {:?}", other),
        }
        match rx.recv().await.unwrap() {
            PipelineEvent::StepComplete { duration_ms, .. } => assert_eq!(duration_ms, 1500),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dropped_receiver_does_not_error() {
        let (sink, rx) = ChannelEventSink::new(1);
        drop(rx);
        // Must not panic or return an error to the engine
        sink.job_error("job-1", "boom", Some("render")).await;
    }

    #[test]
    fn test_event_serialization_shape() {
        let event = PipelineEvent::StepError {
            job_id: "job-1".into(),
            step: "RENDER".into(),
            error: "worker 5xx".into(),
            timestamp: now(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "step_error");
        assert_eq!(value["step"], "RENDER");
    }
}
