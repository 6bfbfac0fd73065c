use crate::config::EngineConfig;
use crate::error::StepError;
use crate::events::{self, EventSink, EventType};
use crate::template;
use crate::types::{ExecutionId, StepDefinition, StepId, StepType};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Request handed to the agent backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    pub agent: String,
    pub step_type: StepType,
    pub inputs: Value,
    pub timeout: Duration,
    pub execution_id: ExecutionId,
    pub step_id: StepId,
    pub user_id: String,
}

/// Backend that performs agent-typed steps
#[async_trait::async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(&self, request: AgentRequest) -> Result<Value>;
}

/// Outbound HTTP request of an `api_call` step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiRequest {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
    pub timeout: Duration,
    pub execution_id: ExecutionId,
    pub step_id: StepId,
    pub user_id: String,
}

/// Backend that performs `api_call` steps
#[async_trait::async_trait]
pub trait ApiInvoker: Send + Sync {
    async fn call(&self, request: ApiRequest) -> Result<Value>;
}

/// Rejects every call; used until a host wires a real `ApiInvoker`
pub struct DisabledApiInvoker;

#[async_trait::async_trait]
impl ApiInvoker for DisabledApiInvoker {
    async fn call(&self, request: ApiRequest) -> Result<Value> {
        anyhow::bail!(
            "api_call to {} rejected: no API invoker configured",
            request.url
        )
    }
}

/// Per-run values threaded through every step call
#[derive(Debug, Clone)]
pub struct StepScope {
    pub execution_id: ExecutionId,
    pub user_id: String,
    pub depth: u32,
    pub token: CancellationToken,
}

/// Outcome of a step call together with the attempts it took
#[derive(Debug)]
pub struct Invocation {
    pub result: std::result::Result<Value, StepError>,
    pub attempts: u32,
}

impl Invocation {
    pub fn once(result: std::result::Result<Value, StepError>) -> Self {
        Self {
            result,
            attempts: 1,
        }
    }
}

/// Step executor with retry and timeout logic
pub struct StepExecutor {
    agents: Arc<dyn AgentInvoker>,
    apis: Arc<dyn ApiInvoker>,
    events: Arc<dyn EventSink>,
    config: EngineConfig,
}

impl StepExecutor {
    pub fn new(
        agents: Arc<dyn AgentInvoker>,
        apis: Arc<dyn ApiInvoker>,
        events: Arc<dyn EventSink>,
        config: EngineConfig,
    ) -> Self {
        Self {
            agents,
            apis,
            events,
            config,
        }
    }

    pub fn set_api_invoker(&mut self, apis: Arc<dyn ApiInvoker>) {
        self.apis = apis;
    }

    pub fn set_event_sink(&mut self, events: Arc<dyn EventSink>) {
        self.events = events;
    }

    fn timeout_for(&self, step: &StepDefinition) -> Duration {
        Duration::from_secs(
            step.timeout_seconds
                .unwrap_or(self.config.default_step_timeout_secs),
        )
    }

    /// Invoke the agent backend for an agent-backed step
    pub async fn run_agent(
        &self,
        scope: &StepScope,
        step: &StepDefinition,
        inputs: Value,
    ) -> Invocation {
        let Some(agent) = step.agent_ref() else {
            return Invocation::once(Err(StepError::Config(format!(
                "step '{}' has no agent reference",
                step.id
            ))));
        };

        let request = AgentRequest {
            agent: agent.to_string(),
            step_type: step.step_type,
            inputs,
            timeout: self.timeout_for(step),
            execution_id: scope.execution_id,
            step_id: step.id.clone(),
            user_id: scope.user_id.clone(),
        };

        tracing::debug!(
            execution_id = %scope.execution_id,
            step_id = %step.id,
            agent,
            "Invoking agent"
        );

        self.with_retry(scope, step, || self.agents.invoke(request.clone()))
            .await
    }

    /// Send the request described by an `api_call` step's resolved inputs
    pub async fn run_api(&self, scope: &StepScope, step: &StepDefinition, inputs: Value) -> Invocation {
        let request = match api_request(scope, step, &inputs, self.timeout_for(step)) {
            Ok(request) => request,
            Err(e) => return Invocation::once(Err(e)),
        };

        tracing::debug!(
            execution_id = %scope.execution_id,
            step_id = %step.id,
            method = %request.method,
            url = %request.url,
            "Calling API"
        );

        self.with_retry(scope, step, || self.apis.call(request.clone()))
            .await
    }

    /// Run `call` under the step deadline, retrying retryable failures with
    /// capped exponential backoff. Cancellation interrupts both the call and
    /// the backoff sleep.
    async fn with_retry<F, Fut>(&self, scope: &StepScope, step: &StepDefinition, call: F) -> Invocation
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        let timeout = self.timeout_for(step);
        let max_attempts = step.max_retries.saturating_add(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let result = tokio::select! {
                _ = scope.token.cancelled() => Err(StepError::Cancelled),
                outcome = tokio::time::timeout(timeout, call()) => match outcome {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(StepError::Invocation(format!("{:#}", e))),
                    Err(_) => Err(StepError::Timeout { secs: timeout.as_secs() }),
                },
            };

            let error = match result {
                Ok(value) => {
                    return Invocation {
                        result: Ok(value),
                        attempts: attempt,
                    }
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => e,
                Err(e) => {
                    return Invocation {
                        result: Err(e),
                        attempts: attempt,
                    }
                }
            };

            let delay = self.config.retry_backoff(attempt);
            tracing::warn!(
                execution_id = %scope.execution_id,
                step_id = %step.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Step attempt failed, retrying"
            );

            events::emit(
                self.events.as_ref(),
                scope.execution_id,
                EventType::StepRetrying {
                    step_id: step.id.clone(),
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                    error: error.to_string(),
                },
            )
            .await;

            tokio::select! {
                _ = scope.token.cancelled() => {
                    return Invocation {
                        result: Err(StepError::Cancelled),
                        attempts: attempt,
                    }
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

fn api_request(
    scope: &StepScope,
    step: &StepDefinition,
    inputs: &Value,
    timeout: Duration,
) -> std::result::Result<ApiRequest, StepError> {
    let url = match inputs.get("url") {
        Some(Value::String(url)) if !url.trim().is_empty() => url.clone(),
        _ => {
            return Err(StepError::Config(format!(
                "api_call step '{}' resolved without a url",
                step.id
            )))
        }
    };

    let body = inputs.get("body").filter(|b| !b.is_null()).cloned();
    let method = match inputs.get("method").and_then(Value::as_str) {
        Some(method) => method.to_ascii_uppercase(),
        None if body.is_some() => "POST".to_string(),
        None => "GET".to_string(),
    };

    let headers = match inputs.get("headers") {
        Some(Value::Object(map)) => map
            .iter()
            .map(|(name, value)| (name.clone(), template::to_display(value)))
            .collect(),
        _ => BTreeMap::new(),
    };

    Ok(ApiRequest {
        method,
        url,
        headers,
        body,
        timeout,
        execution_id: scope.execution_id,
        step_id: step.id.clone(),
        user_id: scope.user_id.clone(),
    })
}

/// Wrap bare results so every step output is an object:
/// strings become `{content, success}`, other scalars and arrays `{value, success}`
pub fn normalize_output(output: Value) -> Value {
    match output {
        Value::Object(_) | Value::Null => output,
        Value::String(content) => json!({ "content": content, "success": true }),
        other => json!({ "value": other, "success": true }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullEventSink;
    use crate::storage::MemoryEventLog;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` calls, then echoes the inputs
    struct FlakyAgent {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl AgentInvoker for FlakyAgent {
        async fn invoke(&self, request: AgentRequest) -> Result<Value> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                anyhow::bail!("transient failure {}", call);
            }
            Ok(json!({ "echo": request.inputs }))
        }
    }

    struct SlowAgent;

    #[async_trait::async_trait]
    impl AgentInvoker for SlowAgent {
        async fn invoke(&self, _request: AgentRequest) -> Result<Value> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Value::Null)
        }
    }

    struct RecordingApi {
        requests: tokio::sync::Mutex<Vec<ApiRequest>>,
    }

    #[async_trait::async_trait]
    impl ApiInvoker for RecordingApi {
        async fn call(&self, request: ApiRequest) -> Result<Value> {
            self.requests.lock().await.push(request);
            Ok(json!({"status": 200}))
        }
    }

    fn scope() -> StepScope {
        StepScope {
            execution_id: ExecutionId::new(),
            user_id: "u-1".to_string(),
            depth: 0,
            token: CancellationToken::new(),
        }
    }

    fn step(value: Value) -> StepDefinition {
        serde_json::from_value(value).unwrap()
    }

    fn executor(agents: Arc<dyn AgentInvoker>, events: Arc<dyn EventSink>) -> StepExecutor {
        StepExecutor::new(
            agents,
            Arc::new(DisabledApiInvoker),
            events,
            EngineConfig::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_success() {
        let agent = Arc::new(FlakyAgent {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let log = Arc::new(MemoryEventLog::new());
        let executor = executor(agent.clone(), log.clone());
        let step = step(json!({"id": "a", "agent": "x", "max_retries": 2}));

        let invocation = executor.run_agent(&scope(), &step, json!({"task": "x"})).await;

        assert_eq!(invocation.attempts, 3);
        assert_eq!(invocation.result.unwrap(), json!({"echo": {"task": "x"}}));

        let retries: Vec<_> = log
            .events()
            .await
            .into_iter()
            .filter_map(|e| match e.event_type {
                EventType::StepRetrying { delay_ms, .. } => Some(delay_ms),
                _ => None,
            })
            .collect();
        assert_eq!(retries, vec![1000, 2000]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted() {
        let agent = Arc::new(FlakyAgent {
            failures: 10,
            calls: AtomicU32::new(0),
        });
        let executor = executor(agent.clone(), Arc::new(NullEventSink));
        let step = step(json!({"id": "a", "agent": "x", "max_retries": 1}));

        let invocation = executor.run_agent(&scope(), &step, Value::Null).await;

        assert_eq!(invocation.attempts, 2);
        assert!(matches!(invocation.result, Err(StepError::Invocation(_))));
        assert_eq!(agent.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retryable() {
        let executor = executor(Arc::new(SlowAgent), Arc::new(NullEventSink));
        let step = step(json!({
            "id": "a", "agent": "x", "timeout_seconds": 5, "max_retries": 1
        }));

        let invocation = executor.run_agent(&scope(), &step, Value::Null).await;

        assert_eq!(invocation.attempts, 2);
        assert!(matches!(
            invocation.result,
            Err(StepError::Timeout { secs: 5 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_call() {
        let executor = executor(Arc::new(SlowAgent), Arc::new(NullEventSink));
        let step = step(json!({"id": "a", "agent": "x"}));
        let scope = scope();

        let token = scope.token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        });

        let invocation = executor.run_agent(&scope, &step, Value::Null).await;
        assert!(matches!(invocation.result, Err(StepError::Cancelled)));
        assert_eq!(invocation.attempts, 1);
    }

    #[tokio::test]
    async fn test_api_request_shape() {
        let api = Arc::new(RecordingApi {
            requests: tokio::sync::Mutex::new(Vec::new()),
        });
        let mut executor = executor(Arc::new(SlowAgent), Arc::new(NullEventSink));
        executor.set_api_invoker(api.clone());
        let step = step(json!({
            "id": "hook", "step_type": "api_call", "inputs": {"url": "http://x"}
        }));

        let invocation = executor
            .run_api(
                &scope(),
                &step,
                json!({
                    "url": "https://hooks.example.com/notify",
                    "headers": {"X-Count": 3},
                    "body": {"text": "hi"}
                }),
            )
            .await;

        assert_eq!(invocation.result.unwrap(), json!({"status": 200}));
        let requests = api.requests.lock().await;
        assert_eq!(requests[0].method, "POST");
        assert_eq!(requests[0].headers["X-Count"], "3");
        assert_eq!(requests[0].body, Some(json!({"text": "hi"})));
    }

    #[tokio::test]
    async fn test_disabled_api_invoker_fails() {
        let executor = executor(Arc::new(SlowAgent), Arc::new(NullEventSink));
        let step = step(json!({
            "id": "hook", "step_type": "api_call", "inputs": {"url": "http://x"}
        }));

        let invocation = executor
            .run_api(&scope(), &step, json!({"url": "http://x", "method": "get"}))
            .await;
        assert!(matches!(invocation.result, Err(StepError::Invocation(_))));
    }

    #[test]
    fn test_normalize_output() {
        assert_eq!(
            normalize_output(json!("done")),
            json!({"content": "done", "success": true})
        );
        assert_eq!(
            normalize_output(json!(3)),
            json!({"value": 3, "success": true})
        );
        assert_eq!(normalize_output(json!({"a": 1})), json!({"a": 1}));
        assert_eq!(normalize_output(Value::Null), Value::Null);
    }
}
