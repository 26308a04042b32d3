/// Log Relay
///
/// Fans live output out to any number of subscribers and replays persisted
/// output for jobs that are no longer live. Each live job keeps a bounded event
/// history so a subscriber joining mid-run first receives everything retained
/// so far, then the live tail, in one ordered channel. Past the bound the
/// oldest events are dropped.
///
/// `complete` delivers the final event to every subscriber and drops the
/// channel, which ends every subscription stream.
use crate::workspace::Workspace;
use chrono::Utc;
use futures_util::Stream;
use parking_lot::Mutex;
use scriptbox_common::store::{JobStore, StoreError};
use scriptbox_common::types::{JobId, JobStatus, LogEvent, LogStream};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to read persisted log: {0}")]
    Io(#[from] io::Error),
}

/// Events retained per live job
pub const MAX_HISTORY_EVENTS: usize = 100_000;

#[derive(Default)]
struct Channel {
    history: VecDeque<LogEvent>,
    subscribers: Vec<mpsc::UnboundedSender<LogEvent>>,
    lines: u64,
    dropped: u64,
}

impl Channel {
    fn record(&mut self, job_id: JobId, event: LogEvent, limit: usize) {
        self.broadcast(&event);
        self.history.push_back(event);
        while self.history.len() > limit {
            self.history.pop_front();
            self.dropped += 1;
            if self.dropped == 1 {
                warn!(job_id = %job_id, limit, "Relay history full, dropping oldest output");
            }
        }
    }

    /// Send to every subscriber, dropping only the ones that went away
    fn broadcast(&mut self, event: &LogEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

pub struct LogRelay {
    channels: Mutex<HashMap<JobId, Channel>>,
    store: Arc<dyn JobStore>,
    workspace: Arc<Workspace>,
    history_limit: usize,
}

/// Receiving end of one subscription. Dropping it unsubscribes.
pub struct LogSubscription {
    rx: mpsc::UnboundedReceiver<LogEvent>,
}

impl LogSubscription {
    pub async fn recv(&mut self) -> Option<LogEvent> {
        self.rx.recv().await
    }
}

impl Stream for LogSubscription {
    type Item = LogEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl LogRelay {
    pub fn new(store: Arc<dyn JobStore>, workspace: Arc<Workspace>) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            store,
            workspace,
            history_limit: MAX_HISTORY_EVENTS,
        }
    }

    #[cfg(test)]
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    pub fn history_limit(&self) -> usize {
        self.history_limit
    }

    /// Start accepting events for a job
    pub fn open(&self, job_id: JobId) {
        self.channels.lock().entry(job_id).or_default();
    }

    pub fn publish(&self, job_id: JobId, stream: LogStream, message: String) {
        let mut channels = self.channels.lock();
        let Some(channel) = channels.get_mut(&job_id) else {
            debug!(job_id = %job_id, "Dropping output for job without live channel");
            return;
        };
        channel.lines += 1;
        let event = LogEvent::Log {
            job_id,
            stream,
            message,
            line_number: Some(channel.lines),
            timestamp: Utc::now(),
        };
        channel.record(job_id, event, self.history_limit);
    }

    pub fn publish_status(&self, job_id: JobId, status: JobStatus) {
        let mut channels = self.channels.lock();
        if let Some(channel) = channels.get_mut(&job_id) {
            let event = LogEvent::Status {
                job_id,
                status,
                timestamp: Utc::now(),
            };
            channel.record(job_id, event, self.history_limit);
        }
    }

    /// Output lines published so far, in order
    pub fn lines(&self, job_id: JobId) -> Vec<String> {
        self.channels
            .lock()
            .get(&job_id)
            .map(|c| {
                c.history
                    .iter()
                    .filter_map(|e| e.message().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Deliver the final event and close every subscription for the job
    pub fn complete(
        &self,
        job_id: JobId,
        status: JobStatus,
        exit_code: Option<i64>,
        duration_seconds: Option<f64>,
    ) {
        let channel = self.channels.lock().remove(&job_id);
        if let Some(mut channel) = channel {
            let event = LogEvent::Complete {
                job_id,
                status,
                exit_code,
                duration_seconds,
                timestamp: Utc::now(),
            };
            channel.broadcast(&event);
            debug!(
                job_id = %job_id,
                subscribers = channel.subscribers.len(),
                dropped = channel.dropped,
                "Relay closed"
            );
        }
    }

    /// Subscribe to a job's output.
    ///
    /// A live job yields its history so far followed by the live tail. Otherwise
    /// the persisted log is replayed, followed by `complete` when the stored job
    /// is terminal.
    pub async fn subscribe(&self, job_id: JobId) -> Result<LogSubscription, RelayError> {
        let (tx, rx) = mpsc::unbounded_channel();

        {
            let mut channels = self.channels.lock();
            if let Some(channel) = channels.get_mut(&job_id) {
                for event in &channel.history {
                    // receiver is held right here
                    let _ = tx.send(event.clone());
                }
                channel.subscribers.push(tx);
                return Ok(LogSubscription { rx });
            }
        }

        let job = self
            .store
            .load(job_id)
            .await?
            .ok_or(RelayError::NotFound(job_id))?;

        for event in self.replay_from_store(job_id, 0).await? {
            let _ = tx.send(event);
        }
        if job.is_terminal() {
            let _ = tx.send(LogEvent::Complete {
                job_id,
                status: job.status,
                exit_code: job.exit_code,
                duration_seconds: job.duration_seconds,
                timestamp: Utc::now(),
            });
        } else {
            warn!(job_id = %job_id, status = %job.status, "Replaying non-terminal job without live channel");
        }
        Ok(LogSubscription { rx })
    }

    /// Persisted lines from `start_offset` (0-based) on, as log events.
    ///
    /// The log file does not record which stream a line came from, so replayed
    /// lines are reported as stdout.
    pub async fn replay_from_store(
        &self,
        job_id: JobId,
        start_offset: usize,
    ) -> Result<Vec<LogEvent>, RelayError> {
        let lines = self
            .workspace
            .read_log_lines(job_id)
            .await?
            .unwrap_or_default();
        let now = Utc::now();
        Ok(lines
            .into_iter()
            .enumerate()
            .skip(start_offset)
            .map(|(idx, message)| LogEvent::Log {
                job_id,
                stream: LogStream::Stdout,
                message,
                line_number: Some(idx as u64 + 1),
                timestamp: now,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use scriptbox_common::store::MemoryJobStore;
    use scriptbox_common::types::{Allocation, ExecutionMode, Job, JobOutcome, JobSpec, ProfileName};
    use uuid::Uuid;

    fn job() -> Job {
        Job::new(
            Uuid::new_v4(),
            &JobSpec::new("print(1)"),
            Allocation {
                execution_mode: ExecutionMode::Cpu,
                resource_profile: ProfileName::Small,
                timeout_seconds: 60,
                auto_allocated: false,
                reasoning: None,
            },
            Utc::now(),
        )
    }

    fn relay(dir: &tempfile::TempDir) -> (LogRelay, Arc<MemoryJobStore>, Arc<Workspace>) {
        let store = Arc::new(MemoryJobStore::new());
        let workspace = Arc::new(Workspace::new(
            dir.path().join("scripts"),
            dir.path().join("logs"),
        ));
        (
            LogRelay::new(store.clone(), workspace.clone()),
            store,
            workspace,
        )
    }

    fn messages(events: &[LogEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| e.message().map(str::to_string))
            .collect()
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_replay_then_complete() {
        let dir = tempfile::tempdir().unwrap();
        let (relay, store, workspace) = relay(&dir);

        let mut job = job();
        job.mark_queued(Utc::now()).unwrap();
        job.mark_running(Utc::now(), "c".into()).unwrap();
        job.finalize(&JobOutcome::Exited { exit_code: 0 }, Utc::now());
        store.create(&job).await.unwrap();
        workspace
            .write_log(job.id, &["one".to_string(), "two".to_string()])
            .await
            .unwrap();

        let sub = relay.subscribe(job.id).await.unwrap();
        let events: Vec<LogEvent> = sub.collect().await;

        assert_eq!(messages(&events), vec!["one", "two"]);
        assert_eq!(events.len(), 3);
        match &events[2] {
            LogEvent::Complete {
                status, exit_code, ..
            } => {
                assert_eq!(*status, JobStatus::Success);
                assert_eq!(*exit_code, Some(0));
            }
            other => panic!("expected complete, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concurrent_subscribers_see_same_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let (relay, _store, _ws) = relay(&dir);
        let id = Uuid::new_v4();
        relay.open(id);

        relay.publish(id, LogStream::Stdout, "a".into());
        let first = relay.subscribe(id).await.unwrap();
        relay.publish(id, LogStream::Stderr, "b".into());
        let second = relay.subscribe(id).await.unwrap();
        relay.publish(id, LogStream::Stdout, "c".into());
        relay.complete(id, JobStatus::Success, Some(0), Some(1.0));

        let a: Vec<LogEvent> = first.collect().await;
        let b: Vec<LogEvent> = second.collect().await;
        assert_eq!(messages(&a), vec!["a", "b", "c"]);
        assert_eq!(a, b);
        assert!(a.last().unwrap().is_complete());
    }

    #[tokio::test]
    async fn test_no_events_after_complete() {
        let dir = tempfile::tempdir().unwrap();
        let (relay, _store, _ws) = relay(&dir);
        let id = Uuid::new_v4();
        relay.open(id);
        let mut sub = relay.subscribe(id).await.unwrap();

        relay.complete(id, JobStatus::Cancelled, None, None);
        relay.publish(id, LogStream::Stdout, "late".into());

        assert!(sub.recv().await.unwrap().is_complete());
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_subscriber_removed_alone() {
        let dir = tempfile::tempdir().unwrap();
        let (relay, _store, _ws) = relay(&dir);
        let id = Uuid::new_v4();
        relay.open(id);

        let gone = relay.subscribe(id).await.unwrap();
        let mut kept = relay.subscribe(id).await.unwrap();
        drop(gone);

        relay.publish(id, LogStream::Stdout, "x".into());
        assert_eq!(relay.channels.lock()[&id].subscribers.len(), 1);
        assert_eq!(kept.recv().await.unwrap().message(), Some("x"));
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let (relay, _store, _ws) = relay(&dir);
        let relay = relay.with_history_limit(3);
        let id = Uuid::new_v4();
        relay.open(id);

        let mut early = relay.subscribe(id).await.unwrap();
        for line in ["a", "b", "c", "d", "e"] {
            relay.publish(id, LogStream::Stdout, line.into());
        }
        assert_eq!(relay.lines(id), vec!["c", "d", "e"]);

        // a live subscriber still saw every line
        for expected in ["a", "b", "c", "d", "e"] {
            assert_eq!(early.recv().await.unwrap().message(), Some(expected));
        }

        let late: Vec<LogEvent> = {
            let sub = relay.subscribe(id).await.unwrap();
            relay.complete(id, JobStatus::Success, Some(0), None);
            sub.collect().await
        };
        assert_eq!(messages(&late), vec!["c", "d", "e"]);
        match &late[0] {
            LogEvent::Log { line_number, .. } => assert_eq!(*line_number, Some(3)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_replay_offset() {
        let dir = tempfile::tempdir().unwrap();
        let (relay, _store, workspace) = relay(&dir);
        let id = Uuid::new_v4();
        let lines: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        workspace.write_log(id, &lines).await.unwrap();

        let events = relay.replay_from_store(id, 1).await.unwrap();
        assert_eq!(messages(&events), vec!["b", "c"]);
        match &events[0] {
            LogEvent::Log { line_number, .. } => assert_eq!(*line_number, Some(2)),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let dir = tempfile::tempdir().unwrap();
        let (relay, _store, _ws) = relay(&dir);
        assert!(matches!(
            relay.subscribe(Uuid::new_v4()).await,
            Err(RelayError::NotFound(_))
        ));
    }
}
