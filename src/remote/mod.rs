//! Remote executor client.
//!
//! # Responsibilities
//! - Ask an external automation service to start or stop a service on a
//!   target machine
//! - Poll task status until completion
//! - Report failures as attempt failures, never hang a startup loop
//!
//! # Design Decisions
//! - The orchestrator sees only the {start, stop, poll} trait; the
//!   HTTP/JSON implementation is the default collaborator and alternative
//!   back-ends plug in behind the same trait
//! - An unreachable executor is an attempt failure, not a panic or an
//!   indefinite wait

use std::collections::HashMap;
use std::time::Duration;
use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::config::schema::ExecutorConfig;

/// Error type for remote execution.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Automation service unreachable or returned a transport error.
    #[error("Executor unreachable: {0}")]
    Unreachable(String),

    /// Automation service answered with an unexpected status or payload.
    #[error("Executor protocol error: {0}")]
    Protocol(String),

    /// The automation task finished in a failed state.
    #[error("Task failed: {0}")]
    TaskFailed(String),

    /// The task did not finish within the configured timeout.
    #[error("Task timed out after {0:?}")]
    TaskTimeout(Duration),
}

/// Opaque handle to a submitted automation task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHandle(pub String);

/// Observed status of an automation task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    Success,
    Failed(String),
}

/// Contract between the startup orchestrator / idle monitor and the
/// automation service.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn start(
        &self,
        service_id: &str,
        machine_id: &str,
        template_id: &str,
        extra_vars: &HashMap<String, String>,
    ) -> Result<TaskHandle, ExecutorError>;

    async fn stop(
        &self,
        service_id: &str,
        machine_id: &str,
        template_id: &str,
        extra_vars: &HashMap<String, String>,
    ) -> Result<TaskHandle, ExecutorError>;

    async fn poll(&self, task: &TaskHandle) -> Result<TaskStatus, ExecutorError>;
}

/// Default implementation speaking HTTP/JSON to the automation service:
/// `POST /api/project/{p}/tasks` to submit, `GET /api/project/{p}/tasks/{id}`
/// to poll.
pub struct HttpExecutor {
    client: reqwest::Client,
    base_url: Url,
    project_id: String,
}

#[derive(Debug, Deserialize)]
struct TaskCreated {
    id: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct TaskView {
    status: String,
    #[serde(default)]
    message: Option<String>,
}

impl HttpExecutor {
    pub fn new(config: &ExecutorConfig) -> Result<Self, ExecutorError> {
        let base_url = config
            .base_url
            .clone()
            .ok_or_else(|| ExecutorError::Protocol("executor.base_url is not set".to_string()))?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .map_err(|e| ExecutorError::Unreachable(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            project_id: config.project_id.clone(),
        })
    }

    fn tasks_url(&self) -> Result<Url, ExecutorError> {
        self.base_url
            .join(&format!("api/project/{}/tasks", self.project_id))
            .map_err(|e| ExecutorError::Protocol(e.to_string()))
    }

    async fn submit(
        &self,
        action: &str,
        service_id: &str,
        machine_id: &str,
        template_id: &str,
        extra_vars: &HashMap<String, String>,
    ) -> Result<TaskHandle, ExecutorError> {
        let mut vars = extra_vars.clone();
        vars.insert("service_id".to_string(), service_id.to_string());
        vars.insert("machine_id".to_string(), machine_id.to_string());

        let body = serde_json::json!({
            "template_id": template_id,
            "machine_id": machine_id,
            "extra_vars": vars,
        });

        let response = self
            .client
            .post(self.tasks_url()?)
            .json(&body)
            .send()
            .await
            .map_err(|e| ExecutorError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExecutorError::Protocol(format!(
                "task submit returned {status}"
            )));
        }

        let created: TaskCreated = response
            .json()
            .await
            .map_err(|e| ExecutorError::Protocol(e.to_string()))?;

        let id = match &created.id {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            other => {
                return Err(ExecutorError::Protocol(format!(
                    "unexpected task id {other}"
                )))
            }
        };

        tracing::info!(
            service = %service_id,
            machine = %machine_id,
            template = %template_id,
            task = %id,
            action = %action,
            "Submitted automation task"
        );
        Ok(TaskHandle(id))
    }
}

#[async_trait]
impl RemoteExecutor for HttpExecutor {
    async fn start(
        &self,
        service_id: &str,
        machine_id: &str,
        template_id: &str,
        extra_vars: &HashMap<String, String>,
    ) -> Result<TaskHandle, ExecutorError> {
        self.submit("start", service_id, machine_id, template_id, extra_vars)
            .await
    }

    async fn stop(
        &self,
        service_id: &str,
        machine_id: &str,
        template_id: &str,
        extra_vars: &HashMap<String, String>,
    ) -> Result<TaskHandle, ExecutorError> {
        self.submit("stop", service_id, machine_id, template_id, extra_vars)
            .await
    }

    async fn poll(&self, task: &TaskHandle) -> Result<TaskStatus, ExecutorError> {
        let url = self
            .base_url
            .join(&format!("api/project/{}/tasks/{}", self.project_id, task.0))
            .map_err(|e| ExecutorError::Protocol(e.to_string()))?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ExecutorError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExecutorError::Protocol(format!(
                "task poll returned {status}"
            )));
        }

        let view: TaskView = response
            .json()
            .await
            .map_err(|e| ExecutorError::Protocol(e.to_string()))?;

        Ok(match view.status.as_str() {
            "success" => TaskStatus::Success,
            "error" | "failed" => TaskStatus::Failed(
                view.message.unwrap_or_else(|| "task reported failure".to_string()),
            ),
            _ => TaskStatus::Running,
        })
    }
}

/// Poll `task` until it finishes, at `poll_interval`, giving up after
/// `timeout`.
pub async fn await_task(
    executor: &dyn RemoteExecutor,
    task: &TaskHandle,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<(), ExecutorError> {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        match executor.poll(task).await? {
            TaskStatus::Success => return Ok(()),
            TaskStatus::Failed(reason) => return Err(ExecutorError::TaskFailed(reason)),
            TaskStatus::Running => {}
        }

        if tokio::time::Instant::now() + poll_interval > deadline {
            return Err(ExecutorError::TaskTimeout(timeout));
        }
        tokio::time::sleep(poll_interval).await;
    }
}

#[cfg(test)]
pub mod testing {
    //! In-memory executor used by unit and integration tests.

    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    /// Scripted executor: each submitted task resolves to the next
    /// programmed outcome.
    pub struct ScriptedExecutor {
        outcomes: Mutex<Vec<TaskStatus>>,
        next_id: AtomicU64,
        pub started: Mutex<Vec<String>>,
        pub stopped: Mutex<Vec<String>>,
    }

    impl ScriptedExecutor {
        pub fn new(outcomes: Vec<TaskStatus>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes),
                next_id: AtomicU64::new(1),
                started: Mutex::new(Vec::new()),
                stopped: Mutex::new(Vec::new()),
            }
        }

        fn next_outcome(&self) -> TaskStatus {
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.is_empty() {
                TaskStatus::Success
            } else {
                outcomes.remove(0)
            }
        }
    }

    #[async_trait]
    impl RemoteExecutor for ScriptedExecutor {
        async fn start(
            &self,
            service_id: &str,
            _machine_id: &str,
            _template_id: &str,
            _extra_vars: &HashMap<String, String>,
        ) -> Result<TaskHandle, ExecutorError> {
            self.started.lock().unwrap().push(service_id.to_string());
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            Ok(TaskHandle(id.to_string()))
        }

        async fn stop(
            &self,
            service_id: &str,
            _machine_id: &str,
            _template_id: &str,
            _extra_vars: &HashMap<String, String>,
        ) -> Result<TaskHandle, ExecutorError> {
            self.stopped.lock().unwrap().push(service_id.to_string());
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            Ok(TaskHandle(id.to_string()))
        }

        async fn poll(&self, _task: &TaskHandle) -> Result<TaskStatus, ExecutorError> {
            Ok(self.next_outcome())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedExecutor;
    use super::*;

    #[tokio::test]
    async fn await_task_resolves_success() {
        let executor = ScriptedExecutor::new(vec![TaskStatus::Running, TaskStatus::Success]);
        let task = executor
            .start("svc-a", "m1", "t1", &HashMap::new())
            .await
            .unwrap();

        let result = await_task(
            &executor,
            &task,
            Duration::from_millis(1),
            Duration::from_secs(1),
        )
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn await_task_propagates_failure() {
        let executor =
            ScriptedExecutor::new(vec![TaskStatus::Failed("template exploded".to_string())]);
        let task = executor
            .start("svc-a", "m1", "t1", &HashMap::new())
            .await
            .unwrap();

        let err = await_task(
            &executor,
            &task,
            Duration::from_millis(1),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ExecutorError::TaskFailed(_)));
    }

    #[tokio::test]
    async fn await_task_times_out() {
        let executor = ScriptedExecutor::new(vec![
            TaskStatus::Running,
            TaskStatus::Running,
            TaskStatus::Running,
            TaskStatus::Running,
        ]);
        let task = executor
            .start("svc-a", "m1", "t1", &HashMap::new())
            .await
            .unwrap();

        let err = await_task(
            &executor,
            &task,
            Duration::from_millis(5),
            Duration::from_millis(12),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ExecutorError::TaskTimeout(_)));
    }
}
