//! HTTP runner client.
//!
//! Start and stop are JSON request/response calls. The status stream is a
//! long-lived GET whose body is newline-delimited JSON `StepStatusMessage`
//! objects; it has no overall timeout, only a connect timeout.

use super::{
    RunStepRequest, RunStepResponse, RunnerClient, StatusStream, StepStatusMessage,
    StopTaskRequest, WatchStepRequest,
};
use crate::error::{RunnerError, RunnerResult};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::time::Duration;
use tracing::debug;

const RUN_STEP_PATH: &str = "/api/v1/task/step/run";
const STOP_TASK_PATH: &str = "/api/v1/task/stop";
const STEP_STATUS_PATH: &str = "/api/v1/task/step/status";

#[derive(Debug, Clone)]
pub struct HttpRunnerClient {
    client: reqwest::Client,
    request_timeout: Duration,
}

impl HttpRunnerClient {
    pub fn new(request_timeout: Duration) -> RunnerResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            request_timeout,
        })
    }

    fn url(address: &str, path: &str) -> String {
        format!("{}{path}", address.trim_end_matches('/'))
    }
}

#[async_trait]
impl RunnerClient for HttpRunnerClient {
    async fn run_step(
        &self,
        address: &str,
        request: &RunStepRequest,
    ) -> RunnerResult<RunStepResponse> {
        debug!(
            task_id = request.task_id,
            step_index = request.step_index,
            address = %address,
            "Sending run-step request"
        );
        let response = self
            .client
            .post(Self::url(address, RUN_STEP_PATH))
            .timeout(self.request_timeout)
            .json(request)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json::<RunStepResponse>().await?)
    }

    async fn stop_task(&self, address: &str, request: &StopTaskRequest) -> RunnerResult<()> {
        self.client
            .post(Self::url(address, STOP_TASK_PATH))
            .timeout(self.request_timeout)
            .json(request)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn watch_step(
        &self,
        address: &str,
        request: &WatchStepRequest,
    ) -> RunnerResult<StatusStream> {
        let response = self
            .client
            .get(Self::url(address, STEP_STATUS_PATH))
            .query(&[
                ("envId", request.env_id.clone()),
                ("taskId", request.task_id.to_string()),
                ("step", request.step_index.to_string()),
            ])
            .send()
            .await?
            .error_for_status()?;
        Ok(decode_ndjson(response.bytes_stream()))
    }
}

/// Split a byte stream into newline-delimited JSON status messages
pub(crate) fn decode_ndjson<S, B, E>(bytes: S) -> StatusStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<RunnerError> + Send + 'static,
{
    let state = (Box::pin(bytes), Vec::<u8>::new(), false);
    futures::stream::unfold(state, |(mut bytes, mut buffer, mut done)| async move {
        loop {
            if let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                return Some((parse_line(&line), (bytes, buffer, done)));
            }

            if done {
                if buffer.iter().all(u8::is_ascii_whitespace) {
                    return None;
                }
                let line = std::mem::take(&mut buffer);
                return Some((parse_line(&line), (bytes, buffer, done)));
            }

            match bytes.next().await {
                Some(Ok(chunk)) => buffer.extend_from_slice(chunk.as_ref()),
                Some(Err(err)) => {
                    buffer.clear();
                    return Some((Err(err.into()), (bytes, buffer, true)));
                }
                None => done = true,
            }
        }
    })
    .boxed()
}

fn parse_line(line: &[u8]) -> RunnerResult<StepStatusMessage> {
    serde_json::from_slice(line).map_err(|err| RunnerError::Protocol(err.to_string()))
}
