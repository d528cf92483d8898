use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::arm::{ArmClient, RequestOptions};
use crate::error::{describe_arm_error, CloudError};

/// Interval ARM operations are polled at unless a caller says otherwise.
pub const STANDARD_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// How often to poll and for how long in total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout:  Duration,
}

impl PollPolicy {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Standard interval with the given overall budget.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { interval: STANDARD_POLL_INTERVAL, timeout }
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::with_timeout(Duration::from_secs(30 * 60))
    }
}

/// Result of a single poll.
#[derive(Debug, Clone, PartialEq)]
pub enum PollStatus<T> {
    /// Not terminal yet; carries the status the cloud reported.
    Pending(String),
    Succeeded(T),
    Failed { status: String, message: String },
}

/// A long-running operation that can be polled to completion.
#[async_trait]
pub trait Operation: Send {
    type Output: Send;

    /// Human-readable name used in logs and errors.
    fn describe(&self) -> String;

    /// One poll. Transport and HTTP errors are returned as `Err` and end the wait.
    async fn poll(&mut self) -> Result<PollStatus<Self::Output>, CloudError>;
}

// ── Waiter ────────────────────────────────────────────────────────────────────

/// Poll `op` until it reaches a terminal state or `policy.timeout` elapses.
///
/// The deadline also bounds a poll request that is still in flight. On timeout
/// the remote operation is left running; only the local wait stops.
pub async fn await_completion<O: Operation>(mut op: O, policy: &PollPolicy) -> Result<O::Output, CloudError> {
    let operation = op.describe();
    let started = Instant::now();
    let mut last_status: Option<String> = None;

    let outcome = tokio::time::timeout(
        policy.timeout,
        drive(&mut op, &operation, policy.interval, &mut last_status),
    )
    .await;

    match outcome {
        Ok(result) => result,
        Err(_) => Err(CloudError::Timeout {
            operation,
            waited: started.elapsed(),
            last_status,
        }),
    }
}

async fn drive<O: Operation>(
    op: &mut O,
    operation: &str,
    interval: Duration,
    last_status: &mut Option<String>,
) -> Result<O::Output, CloudError> {
    let mut poll = 0u32;
    loop {
        poll += 1;
        match op.poll().await? {
            PollStatus::Succeeded(out) => {
                debug!(operation, poll, "operation succeeded");
                return Ok(out);
            }
            PollStatus::Failed { status, message } => {
                return Err(CloudError::OperationFailed {
                    operation: operation.to_string(),
                    status,
                    message,
                });
            }
            PollStatus::Pending(status) => {
                if poll % 10 == 0 {
                    info!(operation, poll, status = %status, "still waiting for operation");
                } else {
                    debug!(operation, poll, status = %status, "operation pending, waiting");
                }
                *last_status = Some(status);
            }
        }
        tokio::time::sleep(interval).await;
    }
}

// ── Closure-based waits ───────────────────────────────────────────────────────

struct FnOperation<F> {
    name: String,
    f:    F,
}

#[async_trait]
impl<T, F, Fut> Operation for FnOperation<F>
where
    T: Send,
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<PollStatus<T>, CloudError>> + Send,
{
    type Output = T;

    fn describe(&self) -> String {
        self.name.clone()
    }

    async fn poll(&mut self) -> Result<PollStatus<T>, CloudError> {
        (self.f)().await
    }
}

/// Run `f` under the waiter until it reports a terminal status.
pub async fn poll_until<T, F, Fut>(name: &str, policy: &PollPolicy, f: F) -> Result<T, CloudError>
where
    T: Send,
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<PollStatus<T>, CloudError>> + Send,
{
    await_completion(FnOperation { name: name.to_string(), f }, policy).await
}

// ── ARM async operations ──────────────────────────────────────────────────────

/// Follows an `Azure-AsyncOperation` or `Location` URL.
///
/// `Azure-AsyncOperation` endpoints answer with `{"status": ...}`. `Location`
/// endpoints answer 202 while running and 200/204 with the result when done.
pub struct ArmOperation {
    arm:     ArmClient,
    url:     String,
    options: RequestOptions,
    name:    String,
}

impl ArmOperation {
    pub fn new(arm: ArmClient, url: &str, options: RequestOptions, name: impl Into<String>) -> Self {
        Self { arm, url: url.to_string(), options, name: name.into() }
    }
}

#[async_trait]
impl Operation for ArmOperation {
    type Output = Value;

    fn describe(&self) -> String {
        self.name.clone()
    }

    async fn poll(&mut self) -> Result<PollStatus<Value>, CloudError> {
        let resp = self
            .arm
            .execute(reqwest::Method::GET, &self.url, None, &self.options)
            .await?
            .into_result("GET", &self.url)?;

        if resp.status == 202 {
            let status = resp.body["status"].as_str().unwrap_or("Accepted");
            return Ok(PollStatus::Pending(status.to_string()));
        }
        match resp.body.get("status").and_then(Value::as_str) {
            Some(status) => Ok(classify(status, &resp.body)),
            None => Ok(PollStatus::Succeeded(resp.body)),
        }
    }
}

/// Polls a resource's `properties.provisioningState`.
pub struct ProvisioningStateOperation {
    arm:     ArmClient,
    url:     String,
    options: RequestOptions,
    name:    String,
}

impl ProvisioningStateOperation {
    pub fn new(arm: ArmClient, url: &str, options: RequestOptions, name: impl Into<String>) -> Self {
        Self { arm, url: url.to_string(), options, name: name.into() }
    }
}

#[async_trait]
impl Operation for ProvisioningStateOperation {
    type Output = Value;

    fn describe(&self) -> String {
        self.name.clone()
    }

    async fn poll(&mut self) -> Result<PollStatus<Value>, CloudError> {
        let resp = self
            .arm
            .execute(reqwest::Method::GET, &self.url, None, &self.options)
            .await?
            .into_result("GET", &self.url)?;
        match provisioning_state(&resp.body) {
            Some(state) => Ok(classify(state, &resp.body)),
            None => Ok(PollStatus::Succeeded(resp.body)),
        }
    }
}

pub fn provisioning_state(resource: &Value) -> Option<&str> {
    resource["properties"]["provisioningState"].as_str()
}

pub fn is_terminal_state(state: &str) -> bool {
    matches!(state.to_ascii_lowercase().as_str(), "succeeded" | "failed" | "canceled" | "cancelled")
}

fn classify(status: &str, body: &Value) -> PollStatus<Value> {
    match status.to_ascii_lowercase().as_str() {
        "succeeded" => PollStatus::Succeeded(body.clone()),
        "failed" | "canceled" | "cancelled" => {
            let detail = body
                .get("error")
                .or_else(|| body["properties"].get("error"))
                .map(|e| describe_arm_error(&serde_json::json!({ "error": e })))
                .unwrap_or_else(|| format!("status {}", status));
            PollStatus::Failed { status: status.to_string(), message: detail }
        }
        _ => PollStatus::Pending(status.to_string()),
    }
}
