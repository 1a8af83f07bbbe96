//! Job and JobFactory traits
//!
//! Payload semantics live entirely behind these seams. Jobs and
//! factories round-trip over the wire as descriptors
//! (`<tag>|key:=value|...`); `encode` must emit the full descriptor
//! and `set` must accept every key `encode` produces.

use async_trait::async_trait;

use crate::error::Result;

// ─────────────────────────────────────────────────────────────────
// Output Sink
// ─────────────────────────────────────────────────────────────────

/// Opaque consumer of job output. The core hands it to each job
/// before execution and never inspects the content.
pub trait JobSink: Send + Sync {
    fn consume(&self, task_id: &str, output: &str);
}

/// Sink that discards everything
#[derive(Debug, Default)]
pub struct NullSink;

impl JobSink for NullSink {
    fn consume(&self, _task_id: &str, _output: &str) {}
}

// ─────────────────────────────────────────────────────────────────
// Job
// ─────────────────────────────────────────────────────────────────

/// One unit of work
#[async_trait]
pub trait Job: Send + Sync {
    /// Id of the task this job belongs to
    fn task_id(&self) -> &str;

    /// Serialize to a wire descriptor (including the factory tag)
    fn encode(&self) -> String;

    /// Apply one descriptor key/value pair
    fn set(&mut self, key: &str, value: &str) -> Result<()>;

    /// Execute the job, writing output to `sink`. The returned result
    /// is the completion signal; errors send the job to the retry
    /// buffer.
    async fn run(&self, sink: &dyn JobSink) -> Result<()>;
}

// ─────────────────────────────────────────────────────────────────
// Job Factory
// ─────────────────────────────────────────────────────────────────

/// A source of jobs for one task
pub trait JobFactory: Send + Sync {
    /// Id of the task this factory produces jobs for
    fn task_id(&self) -> &str;

    /// Scheduling weight; scales how many jobs are pulled per tick
    fn priority(&self) -> f32;

    /// Produce the next job, or `None` when none is currently available
    fn next_job(&mut self) -> Option<Box<dyn Job>>;

    /// Whether this factory will never produce another job
    fn is_complete(&self) -> bool;

    /// Registry tag naming this factory type on the wire
    fn type_tag(&self) -> &'static str;

    /// Serialize the factory configuration to a wire descriptor
    fn encode(&self) -> String;

    /// Apply one descriptor key/value pair
    fn set(&mut self, key: &str, value: &str) -> Result<()>;
}
