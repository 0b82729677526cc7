//! Routing across several independent pipelines.
//!
//! Each command is routed by a stable hash of its id, so every submission of
//! a given id lands on the same pipeline and keeps that pipeline's ordering.

use std::fmt;

use tracing::info;

use crate::config::PipelineConfig;
use crate::core::{Command, Entity, EntityId};
use crate::error::CommandError;
use crate::lifecycle::{Lifecycle, LifecycleError, Service};
use crate::pipeline::{Pending, Pipeline, PipelineDeps};

/// A fixed set of pipelines sharing one journal, clock, and lock provider.
pub struct PipelineGroup<C: Command> {
    pipelines: Vec<Pipeline<C>>,
}

impl<C: Command> PipelineGroup<C> {
    /// Build `config.pipelines` pipelines (at least one).
    pub fn new(config: PipelineConfig, deps: PipelineDeps<C>) -> Self {
        let count = config.pipelines.max(1);
        let pipelines = (0..count)
            .map(|index| Pipeline::with_index(index, config.clone(), deps.clone()))
            .collect();
        Self { pipelines }
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    /// Index of the pipeline that handles `id`.
    pub fn route(&self, id: EntityId) -> usize {
        (id.as_uuid().as_u128() % self.pipelines.len() as u128) as usize
    }

    /// Submit to the pipeline chosen by the command's id.
    pub async fn submit(&self, command: Entity<C>) -> Result<Pending<C>, CommandError> {
        let index = self.route(command.id());
        self.pipelines[index].submit(command).await
    }

    /// Stop every pipeline and wait for all of them to drain.
    pub async fn shutdown(&self) -> Result<(), LifecycleError> {
        for pipeline in &self.pipelines {
            pipeline.shutdown().await?;
        }
        Ok(())
    }
}

impl<C: Command> Service for PipelineGroup<C> {
    /// `Running` only when every pipeline runs; otherwise the first
    /// pipeline's state.
    fn lifecycle(&self) -> Lifecycle {
        let states: Vec<_> = self.pipelines.iter().map(|p| p.lifecycle()).collect();
        if states.iter().all(|s| *s == Lifecycle::Running) {
            Lifecycle::Running
        } else {
            states
                .into_iter()
                .find(|s| *s != Lifecycle::Running)
                .unwrap_or(Lifecycle::NotStarted)
        }
    }

    fn start(&self) -> Result<(), LifecycleError> {
        for (index, pipeline) in self.pipelines.iter().enumerate() {
            if let Err(e) = pipeline.start() {
                // Undo the ones already running.
                for started in &self.pipelines[..index] {
                    let _ = started.stop();
                }
                return Err(e);
            }
        }
        info!(pipelines = self.pipelines.len(), "pipeline group started");
        Ok(())
    }

    fn stop(&self) -> Result<(), LifecycleError> {
        for pipeline in &self.pipelines {
            pipeline.stop()?;
        }
        Ok(())
    }
}

impl<C: Command> fmt::Debug for PipelineGroup<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineGroup")
            .field("pipelines", &self.pipelines.len())
            .field("state", &self.lifecycle())
            .finish()
    }
}
