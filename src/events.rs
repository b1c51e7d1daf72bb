//! Step records and the typed progress event stream.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::AppError;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

/// Append-only audit entry for one step transition.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub step: String,
    pub status: StepStatus,
    pub message: String,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Install,
    Update,
    Rollback,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Step {
        run_id: String,
        operation: Operation,
        instance_id: Option<String>,
        record: StepRecord,
    },
    Finished {
        run_id: String,
        operation: Operation,
        instance_id: Option<String>,
        success: bool,
    },
}

/// Broadcast channel that any number of upward layers can subscribe to.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ProgressEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    /// Publishing with no subscribers is not an error.
    pub fn publish(&self, event: ProgressEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Records step transitions for one run and mirrors them onto the bus.
pub struct StepRecorder {
    bus: EventBus,
    run_id: String,
    operation: Operation,
    instance_id: Option<String>,
    total_steps: usize,
    records: Vec<StepRecord>,
}

impl StepRecorder {
    pub fn new(bus: EventBus, operation: Operation, instance_id: Option<String>, total_steps: usize) -> Self {
        Self {
            bus,
            run_id: uuid::Uuid::new_v4().to_string(),
            operation,
            instance_id,
            total_steps: total_steps.max(1),
            records: Vec::new(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn set_instance_id(&mut self, instance_id: &str) {
        self.instance_id = Some(instance_id.to_string());
    }

    /// Percentage for a zero-based step index.
    pub fn progress_for(&self, index: usize) -> u8 {
        let pct = (index * 100) / self.total_steps;
        pct.min(100) as u8
    }

    pub fn records(&self) -> &[StepRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<StepRecord> {
        self.records
    }

    fn push(&mut self, step: &str, status: StepStatus, progress: u8, message: String, error: Option<String>) {
        let record = StepRecord {
            step: step.to_string(),
            status,
            message,
            progress,
            error,
            timestamp: Utc::now(),
        };
        match status {
            StepStatus::Failed => log::error!("[{}] {}: {}", self.run_id, step, record.message),
            _ => log::info!("[{}] {} {:?}: {}", self.run_id, step, status, record.message),
        }
        self.bus.publish(ProgressEvent::Step {
            run_id: self.run_id.clone(),
            operation: self.operation,
            instance_id: self.instance_id.clone(),
            record: record.clone(),
        });
        self.records.push(record);
    }

    pub fn begin(&mut self, step: &str, index: usize, message: impl Into<String>) {
        let progress = self.progress_for(index);
        self.push(step, StepStatus::InProgress, progress, message.into(), None);
    }

    pub fn complete(&mut self, step: &str, index: usize, message: impl Into<String>) {
        let progress = self.progress_for(index + 1);
        self.push(step, StepStatus::Completed, progress, message.into(), None);
    }

    pub fn skip(&mut self, step: &str, index: usize, message: impl Into<String>) {
        let progress = self.progress_for(index + 1);
        self.push(step, StepStatus::Skipped, progress, message.into(), None);
    }

    /// Skipped after a tolerated failure; keeps the error on the record.
    pub fn skip_with_error(&mut self, step: &str, index: usize, message: impl Into<String>, error: &AppError) {
        let progress = self.progress_for(index + 1);
        self.push(step, StepStatus::Skipped, progress, message.into(), Some(error.to_string()));
    }

    pub fn fail(&mut self, step: &str, index: usize, error: &AppError) {
        let progress = self.progress_for(index);
        self.push(step, StepStatus::Failed, progress, "Step failed".to_string(), Some(error.to_string()));
    }

    pub fn pending(&mut self, step: &str, index: usize, message: impl Into<String>) {
        let progress = self.progress_for(index);
        self.push(step, StepStatus::Pending, progress, message.into(), None);
    }

    pub fn finish(&self, success: bool) {
        self.bus.publish(ProgressEvent::Finished {
            run_id: self.run_id.clone(),
            operation: self.operation,
            instance_id: self.instance_id.clone(),
            success,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_index_over_total() {
        let recorder = StepRecorder::new(EventBus::new(), Operation::Install, None, 4);
        assert_eq!(recorder.progress_for(0), 0);
        assert_eq!(recorder.progress_for(2), 50);
        assert_eq!(recorder.progress_for(4), 100);
        assert_eq!(recorder.progress_for(9), 100);
    }

    #[tokio::test]
    async fn transitions_are_recorded_and_published() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let mut recorder = StepRecorder::new(bus, Operation::Update, Some("id".to_string()), 2);

        recorder.begin("validate", 0, "Validating");
        recorder.complete("validate", 0, "Valid");
        recorder.fail("stop_service", 1, &AppError::other("boom"));
        recorder.finish(false);

        let statuses: Vec<StepStatus> = recorder.records().iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![StepStatus::InProgress, StepStatus::Completed, StepStatus::Failed]
        );
        assert_eq!(recorder.records()[1].progress, 50);
        assert!(recorder.records()[2].error.is_some());

        let mut received = 0;
        while let Ok(event) = rx.try_recv() {
            received += 1;
            if let ProgressEvent::Finished { success, .. } = event {
                assert!(!success);
            }
        }
        assert_eq!(received, 4);
    }
}
