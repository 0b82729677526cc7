use std::env;
use std::str::FromStr;

use anyhow::{bail, Context, Result};
use dotenvy::dotenv;

/// What `submit` does when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backpressure {
    /// Wait for a free slot.
    #[default]
    Block,
    /// Fail immediately with `CommandError::QueueFull`.
    Reject,
}

impl FromStr for Backpressure {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "block" => Ok(Backpressure::Block),
            "reject" => Ok(Backpressure::Reject),
            other => bail!("unknown backpressure mode '{other}', expected 'block' or 'reject'"),
        }
    }
}

/// Pipeline configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Slots in each pipeline's submission queue.
    pub queue_capacity: usize,
    /// Derive/commit/complete workers per pipeline.
    pub workers: usize,
    /// Independent pipelines behind the dispatcher.
    pub pipelines: usize,
    /// Logical clock slots reserved per command; also the event limit.
    /// Pipelines treat 0 as 1.
    pub max_events_per_command: u64,
    pub backpressure: Backpressure,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            workers: 4,
            pipelines: 1,
            max_events_per_command: 65_536,
            backpressure: Backpressure::Block,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Self::from_vars(|key| env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup.
    pub fn from_vars(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            queue_capacity: parse_or(&get, "CHRONICLE_QUEUE_CAPACITY", defaults.queue_capacity)?,
            workers: parse_or(&get, "CHRONICLE_WORKERS", defaults.workers)?,
            pipelines: parse_or(&get, "CHRONICLE_PIPELINES", defaults.pipelines)?,
            max_events_per_command: parse_or(
                &get,
                "CHRONICLE_MAX_EVENTS_PER_COMMAND",
                defaults.max_events_per_command,
            )?,
            backpressure: parse_or(&get, "CHRONICLE_BACKPRESSURE", defaults.backpressure)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot run.
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            bail!("queue_capacity must be at least 1");
        }
        if self.workers == 0 {
            bail!("workers must be at least 1");
        }
        if self.pipelines == 0 {
            bail!("pipelines must be at least 1");
        }
        if self.max_events_per_command == 0 {
            bail!("max_events_per_command must be at least 1");
        }
        Ok(())
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_pipelines(mut self, pipelines: usize) -> Self {
        self.pipelines = pipelines;
        self
    }

    pub fn with_max_events_per_command(mut self, max: u64) -> Self {
        self.max_events_per_command = max;
        self
    }

    pub fn with_backpressure(mut self, backpressure: Backpressure) -> Self {
        self.backpressure = backpressure;
        self
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| anyhow::anyhow!("{e}"))
            .with_context(|| format!("{key} must be a valid value, got '{raw}'")),
        None => Ok(default),
    }
}
