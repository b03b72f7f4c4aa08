//! # Runner Transport
//!
//! Remote runners execute the provisioning work for a step. The scheduler
//! talks to them through [`RunnerClient`] (start step, stop task, status
//! stream) after resolving a runner id to an address through
//! [`RunnerDirectory`].

pub mod http;
pub mod messages;

pub use http::HttpRunnerClient;
pub use messages::{
    RunStepRequest, RunStepResponse, StepStatusMessage, StopTaskRequest, WatchStepRequest,
};

use crate::config::RunnerConfig;
use crate::error::{RunnerError, RunnerResult};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;

/// Live status pushes for one step, ending when the runner closes the stream
pub type StatusStream = BoxStream<'static, RunnerResult<StepStatusMessage>>;

#[async_trait]
pub trait RunnerClient: Send + Sync {
    async fn run_step(
        &self,
        address: &str,
        request: &RunStepRequest,
    ) -> RunnerResult<RunStepResponse>;

    async fn stop_task(&self, address: &str, request: &StopTaskRequest) -> RunnerResult<()>;

    async fn watch_step(
        &self,
        address: &str,
        request: &WatchStepRequest,
    ) -> RunnerResult<StatusStream>;
}

#[async_trait]
pub trait RunnerDirectory: Send + Sync {
    /// Resolve a runner id to the base address of its service
    async fn resolve(&self, runner_id: &str) -> RunnerResult<String>;
}

/// Directory backed by a fixed runner id to address table
#[derive(Debug, Clone, Default)]
pub struct StaticRunnerDirectory {
    addresses: HashMap<String, String>,
}

impl StaticRunnerDirectory {
    pub fn new(addresses: HashMap<String, String>) -> Self {
        Self { addresses }
    }

    pub fn from_config(config: &RunnerConfig) -> Self {
        Self::new(config.addresses.clone())
    }

    pub fn with_runner(mut self, runner_id: impl Into<String>, address: impl Into<String>) -> Self {
        self.addresses.insert(runner_id.into(), address.into());
        self
    }
}

#[async_trait]
impl RunnerDirectory for StaticRunnerDirectory {
    async fn resolve(&self, runner_id: &str) -> RunnerResult<String> {
        self.addresses
            .get(runner_id)
            .cloned()
            .ok_or_else(|| RunnerError::UnknownRunner(runner_id.to_string()))
    }
}
