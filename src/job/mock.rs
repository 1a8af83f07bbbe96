//! Deterministic mock job implementation
//!
//! Always registered under the `mock` tag: integration tests, local
//! smoke runs and mesh bring-up all use it as a stand-in payload.

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocol::encode_descriptor;

use super::registry::FactoryRegistry;
use super::traits::{Job, JobFactory, JobSink};

/// Registry tag for the mock implementation
pub const MOCK_TAG: &str = "mock";

/// Register the mock factory/job pair
pub fn register_mock(registry: &FactoryRegistry) -> Result<()> {
    registry.register(
        MOCK_TAG,
        || Box::new(MockJobFactory::default()),
        || Box::new(MockJob::default()),
    )
}

// ─────────────────────────────────────────────────────────────────
// Mock Job
// ─────────────────────────────────────────────────────────────────

/// A job that optionally sleeps, then emits one line of output
#[derive(Debug, Clone, Default)]
pub struct MockJob {
    task_id: String,
    seq: u32,
    fail: bool,
    work_ms: u64,
}

impl MockJob {
    pub fn new(task_id: impl Into<String>, seq: u32) -> Self {
        Self {
            task_id: task_id.into(),
            seq,
            fail: false,
            work_ms: 0,
        }
    }

    /// Make the job fail when run
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// Simulated execution time
    pub fn with_work_ms(mut self, work_ms: u64) -> Self {
        self.work_ms = work_ms;
        self
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }
}

#[async_trait]
impl Job for MockJob {
    fn task_id(&self) -> &str {
        &self.task_id
    }

    fn encode(&self) -> String {
        encode_descriptor(
            MOCK_TAG,
            &[
                ("task".to_string(), self.task_id.clone()),
                ("seq".to_string(), self.seq.to_string()),
                ("fail".to_string(), self.fail.to_string()),
                ("work_ms".to_string(), self.work_ms.to_string()),
            ],
        )
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "task" => self.task_id = value.to_string(),
            "seq" => {
                self.seq = value
                    .parse()
                    .map_err(|_| Error::descriptor(format!("bad seq: {value}")))?
            }
            "fail" => {
                self.fail = value
                    .parse()
                    .map_err(|_| Error::descriptor(format!("bad fail flag: {value}")))?
            }
            "work_ms" => {
                self.work_ms = value
                    .parse()
                    .map_err(|_| Error::descriptor(format!("bad work_ms: {value}")))?
            }
            other => return Err(Error::descriptor(format!("unknown job key: {other}"))),
        }
        Ok(())
    }

    async fn run(&self, sink: &dyn JobSink) -> Result<()> {
        if self.work_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.work_ms)).await;
        }
        if self.fail {
            return Err(Error::JobFailed {
                task_id: Some(self.task_id.clone()),
                message: format!("mock job {} asked to fail", self.seq),
            });
        }
        sink.consume(&self.task_id, &format!("mock job {} done", self.seq));
        debug!(task_id = %self.task_id, seq = self.seq, "Mock job ran");
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────
// Mock Factory
// ─────────────────────────────────────────────────────────────────

/// Produces a fixed number of [`MockJob`]s
#[derive(Debug, Clone)]
pub struct MockJobFactory {
    task_id: String,
    priority: f32,
    count: u32,
    produced: u32,
    fail_jobs: bool,
    work_ms: u64,
}

impl Default for MockJobFactory {
    fn default() -> Self {
        Self {
            task_id: String::new(),
            priority: 1.0,
            count: 0,
            produced: 0,
            fail_jobs: false,
            work_ms: 0,
        }
    }
}

impl MockJobFactory {
    pub fn new(task_id: impl Into<String>, count: u32) -> Self {
        Self {
            task_id: task_id.into(),
            count,
            ..Self::default()
        }
    }

    /// Make every produced job fail
    pub fn failing(mut self) -> Self {
        self.fail_jobs = true;
        self
    }

    /// Simulated per-job execution time
    pub fn with_work_ms(mut self, work_ms: u64) -> Self {
        self.work_ms = work_ms;
        self
    }

    pub fn produced(&self) -> u32 {
        self.produced
    }
}

impl JobFactory for MockJobFactory {
    fn task_id(&self) -> &str {
        &self.task_id
    }

    fn priority(&self) -> f32 {
        self.priority
    }

    fn next_job(&mut self) -> Option<Box<dyn Job>> {
        if self.produced >= self.count {
            return None;
        }
        let mut job = MockJob::new(self.task_id.clone(), self.produced)
            .with_work_ms(self.work_ms);
        if self.fail_jobs {
            job = job.failing();
        }
        self.produced += 1;
        Some(Box::new(job))
    }

    fn is_complete(&self) -> bool {
        self.produced >= self.count
    }

    fn type_tag(&self) -> &'static str {
        MOCK_TAG
    }

    fn encode(&self) -> String {
        encode_descriptor(
            MOCK_TAG,
            &[
                ("task".to_string(), self.task_id.clone()),
                ("count".to_string(), self.count.to_string()),
                ("priority".to_string(), self.priority.to_string()),
                ("produced".to_string(), self.produced.to_string()),
            ],
        )
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "task" => self.task_id = value.to_string(),
            "count" => {
                self.count = value
                    .parse()
                    .map_err(|_| Error::descriptor(format!("bad count: {value}")))?
            }
            "priority" => {
                self.priority = value
                    .parse()
                    .map_err(|_| Error::descriptor(format!("bad priority: {value}")))?
            }
            "produced" => {
                self.produced = value
                    .parse()
                    .map_err(|_| Error::descriptor(format!("bad produced: {value}")))?
            }
            other => return Err(Error::descriptor(format!("unknown factory key: {other}"))),
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
