//! Test utilities: a scriptable mock resource provider.
//!
//! Handwritten mocks for dependency injection in unit tests. A shared
//! [`MockScript`] records every provider interaction behind `Arc<Mutex<_>>`
//! so tests can assert on call counts and routing, and lets tests script
//! failures (acquire errors, release errors, page crashes) up front.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::ClusterError;
use crate::event::{ClusterEvent, ClusterReporter};
use crate::job::JobPayload;
use crate::provider::{JobInstance, ResourceProvider, WorkerInstance};

/// Plain numeric payloads for tests that don't care about URLs.
impl JobPayload for u32 {}

/// Affinity key used by group-routing mocks: explicit group, else domain,
/// else one shared bucket.
pub(crate) fn group_key<D: JobPayload>(data: &D) -> String {
    data.group()
        .or_else(|| data.domain())
        .unwrap_or_else(|| "default".to_string())
}

/// Routing behavior a mock worker advertises through `can_handle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CanHandle {
    /// Multiplexing worker: accepts any job at any time.
    Always,
    /// Group-affine worker: accepts jobs whose group key matches its own.
    Group,
}

#[derive(Default)]
struct ScriptInner {
    acquire_errors: VecDeque<String>,
    release_errors: VecDeque<String>,
    page_crashes: VecDeque<String>,
    acquire_count: usize,
    repair_count: usize,
    worker_spawn_times: Vec<Instant>,
    worker_groups: Vec<Option<String>>,
    workers_closed: usize,
    provider_closed: bool,
    /// (worker_id, group key of the handled payload)
    handled: Vec<(usize, Option<String>)>,
}

/// Shared recorder + failure script for a whole mock provider tree.
#[derive(Clone, Default)]
pub(crate) struct MockScript {
    inner: Arc<Mutex<ScriptInner>>,
}

impl MockScript {
    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptInner> {
        self.inner.lock().unwrap()
    }

    pub fn push_acquire_error(&self, message: &str) {
        self.lock().acquire_errors.push_back(message.to_string());
    }

    pub fn fail_next_release(&self, message: &str) {
        self.lock().release_errors.push_back(message.to_string());
    }

    pub fn crash_next_page(&self, message: &str) {
        self.lock().page_crashes.push_back(message.to_string());
    }

    pub fn acquire_count(&self) -> usize {
        self.lock().acquire_count
    }

    pub fn repair_count(&self) -> usize {
        self.lock().repair_count
    }

    pub fn workers_created(&self) -> usize {
        self.lock().worker_spawn_times.len()
    }

    pub fn worker_spawn_times(&self) -> Vec<Instant> {
        self.lock().worker_spawn_times.clone()
    }

    pub fn worker_group(&self, worker_id: usize) -> Option<String> {
        self.lock().worker_groups.get(worker_id).cloned().flatten()
    }

    pub fn workers_closed(&self) -> usize {
        self.lock().workers_closed
    }

    pub fn provider_closed(&self) -> bool {
        self.lock().provider_closed
    }

    pub fn handled(&self) -> Vec<(usize, Option<String>)> {
        self.lock().handled.clone()
    }
}

/// Mock provider whose workers and job instances report into one script.
#[derive(Clone, Default)]
pub(crate) struct MockProvider {
    script: MockScript,
    can_handle: Option<CanHandle>,
    idle_ttl: Option<Duration>,
}

impl MockProvider {
    pub fn with_can_handle(mut self, mode: CanHandle) -> Self {
        self.can_handle = Some(mode);
        self
    }

    pub fn with_idle_ttl(mut self, ttl: Duration) -> Self {
        self.idle_ttl = Some(ttl);
        self
    }

    pub fn script(&self) -> MockScript {
        self.script.clone()
    }
}

impl<D: JobPayload> ResourceProvider<D> for MockProvider {
    type Instance = MockWorkerInstance;

    async fn init(&self) -> Result<(), ClusterError> {
        Ok(())
    }

    async fn worker_instance(&self, data: Option<&D>) -> Result<MockWorkerInstance, ClusterError> {
        let group = match self.can_handle {
            Some(CanHandle::Group) => data.map(group_key),
            _ => None,
        };
        let worker_id = {
            let mut inner = self.script.lock();
            inner.worker_spawn_times.push(Instant::now());
            inner.worker_groups.push(group.clone());
            inner.worker_groups.len() - 1
        };
        let mut instance = MockWorkerInstance::new(worker_id, self.script.clone(), self.can_handle);
        instance.group = group;
        instance.idle_ttl = self.idle_ttl;
        Ok(instance)
    }

    async fn close(&self) -> Result<(), ClusterError> {
        self.script.lock().provider_closed = true;
        Ok(())
    }
}

/// Mock per-worker resource.
pub(crate) struct MockWorkerInstance {
    worker_id: usize,
    script: MockScript,
    can_handle: Option<CanHandle>,
    group: Option<String>,
    idle_ttl: Option<Duration>,
}

impl MockWorkerInstance {
    pub fn new(worker_id: usize, script: MockScript, can_handle: Option<CanHandle>) -> Self {
        Self {
            worker_id,
            script,
            can_handle,
            group: None,
            idle_ttl: None,
        }
    }

    pub fn with_idle_ttl(mut self, ttl: Duration) -> Self {
        self.idle_ttl = Some(ttl);
        self
    }
}

impl<D: JobPayload> WorkerInstance<D> for MockWorkerInstance {
    type Job = MockJobInstance;

    async fn job_instance(&self, data: &D) -> Result<MockJobInstance, ClusterError> {
        let (crash, release_error) = {
            let mut inner = self.script.lock();
            inner.acquire_count += 1;
            if let Some(message) = inner.acquire_errors.pop_front() {
                return Err(ClusterError::Acquire(message));
            }
            let group = data.group().or_else(|| data.domain());
            inner.handled.push((self.worker_id, group));
            (
                inner.page_crashes.pop_front(),
                inner.release_errors.pop_front(),
            )
        };
        Ok(MockJobInstance {
            page: MockPage {
                worker_id: self.worker_id,
            },
            crash: Mutex::new(crash),
            release_error: Mutex::new(release_error),
        })
    }

    async fn repair(&self) -> Result<(), ClusterError> {
        self.script.lock().repair_count += 1;
        Ok(())
    }

    async fn close(&self) -> Result<(), ClusterError> {
        self.script.lock().workers_closed += 1;
        Ok(())
    }

    fn can_handle(&self, data: &D) -> Option<bool> {
        match self.can_handle {
            None => None,
            Some(CanHandle::Always) => Some(true),
            Some(CanHandle::Group) => {
                Some(self.group.as_deref() == Some(group_key(data).as_str()))
            }
        }
    }

    fn idle_ttl(&self) -> Option<Duration> {
        self.idle_ttl
    }
}

/// Mock per-job resource.
pub(crate) struct MockJobInstance {
    page: MockPage,
    crash: Mutex<Option<String>>,
    release_error: Mutex<Option<String>>,
}

impl JobInstance for MockJobInstance {
    type Page = MockPage;

    fn page(&self) -> MockPage {
        self.page.clone()
    }

    fn take_async_error(&self) -> Option<ClusterError> {
        self.crash
            .lock()
            .unwrap()
            .take()
            .map(ClusterError::PageCrashed)
    }

    async fn close(&self) -> Result<(), ClusterError> {
        if let Some(message) = self.release_error.lock().unwrap().take() {
            return Err(ClusterError::Release(message));
        }
        Ok(())
    }
}

/// Stand-in for a browser page handle.
#[derive(Debug, Clone)]
pub(crate) struct MockPage {
    pub worker_id: usize,
}

/// Reporter that records events for assertions.
#[derive(Clone, Default)]
pub(crate) struct RecordingReporter {
    events: Arc<Mutex<Vec<RecordedEvent>>>,
}

#[derive(Debug, Clone)]
pub(crate) enum RecordedEvent {
    Queued,
    TaskError { error: String, will_retry: bool },
}

impl RecordingReporter {
    /// Recorded task errors as (message, will_retry) pairs.
    pub fn task_errors(&self) -> Vec<(String, bool)> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|event| match event {
                RecordedEvent::TaskError { error, will_retry } => {
                    Some((error.clone(), *will_retry))
                }
                RecordedEvent::Queued => None,
            })
            .collect()
    }

    pub fn queued_count(&self) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| matches!(event, RecordedEvent::Queued))
            .count()
    }
}

impl<D> ClusterReporter<D> for RecordingReporter {
    fn report(&self, event: ClusterEvent<'_, D>) {
        let recorded = match event {
            ClusterEvent::Queued { .. } => RecordedEvent::Queued,
            ClusterEvent::TaskError {
                error, will_retry, ..
            } => RecordedEvent::TaskError {
                error: error.to_string(),
                will_retry,
            },
        };
        self.events.lock().unwrap().push(recorded);
    }
}
