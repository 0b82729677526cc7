//! Throughput check for an in-memory repository.
//!
//! Drives `CHRONICLE_BENCH_COMMANDS` increments from `CHRONICLE_BENCH_CALLERS`
//! concurrent callers through a [`MemoryJournal`], then reports what landed.
//! Pipeline settings come from the usual `CHRONICLE_*` variables.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chronicle::{
    async_trait, Command, DerivationContext, DerivationError, EntityRegistry, Event, EventStream,
    Journal, MemoryJournal, PipelineConfig, Receipt, Repository, Service,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const COUNTERS: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Increment {
    counter: String,
    by: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum CounterEvent {
    Incremented { counter: String, by: i64 },
}

impl Event for CounterEvent {
    fn entity_type(&self) -> &'static str {
        "Incremented"
    }
}

#[async_trait]
impl Command for Increment {
    type Event = CounterEvent;
    type Output = usize;

    fn entity_type(&self) -> &'static str {
        "Increment"
    }

    async fn events(
        &self,
        ctx: &DerivationContext<Self>,
    ) -> Result<EventStream<CounterEvent>, DerivationError> {
        if self.by == 0 {
            return Err(DerivationError::rejected("increment by zero"));
        }
        ctx.lock(&self.counter).await?;
        Ok(EventStream::from_vec(vec![CounterEvent::Incremented {
            counter: self.counter.clone(),
            by: self.by,
        }]))
    }

    fn complete(&self, receipt: &Receipt<Self>) -> anyhow::Result<usize> {
        Ok(receipt.events().len())
    }
}

fn env_usize(name: &str, default: usize) -> Result<usize> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .with_context(|| format!("{name} must be a positive integer, got {value:?}")),
        Err(_) => Ok(default),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,chronicle=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = PipelineConfig::from_env().context("Failed to load pipeline config")?;
    let commands = env_usize("CHRONICLE_BENCH_COMMANDS", 10_000)?;
    let callers = env_usize("CHRONICLE_BENCH_CALLERS", 8)?.max(1);

    let registry = EntityRegistry::builder()
        .with_command("Increment")
        .with_event("Incremented")
        .build();

    let journal = Arc::new(MemoryJournal::<Increment>::new());
    let repo = Arc::new(
        Repository::<Increment>::builder(registry)
            .with_journal(journal.clone())
            .with_config(config)
            .build(),
    );
    repo.start().context("Failed to start repository")?;

    info!(commands, callers, "starting run");
    let started = Instant::now();

    let mut tasks = Vec::with_capacity(callers);
    for caller in 0..callers {
        let repo = repo.clone();
        let share = commands / callers + usize::from(caller < commands % callers);
        tasks.push(tokio::spawn(async move {
            let mut failures = 0usize;
            for n in 0..share {
                let command = Increment {
                    counter: format!("counter-{}", (caller + n) % COUNTERS),
                    by: 1,
                };
                if let Err(e) = repo.execute(command).await {
                    warn!(caller, error = %e, "increment failed");
                    failures += 1;
                }
            }
            failures
        }));
    }

    let mut failures = 0;
    for task in tasks {
        failures += task.await.context("Caller task panicked")?;
    }
    let elapsed = started.elapsed();

    let stored = journal.len().await.context("Failed to count journal entries")?;
    repo.shutdown().await.context("Failed to shut down repository")?;

    let succeeded = commands - failures;
    info!(
        succeeded,
        failures,
        elapsed_ms = elapsed.as_millis() as u64,
        per_second = (succeeded as f64 / elapsed.as_secs_f64().max(f64::EPSILON)) as u64,
        "run complete"
    );
    info!(stored, expected = succeeded * 2, "journal contents");

    Ok(())
}
