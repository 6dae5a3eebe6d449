//! Long-running task dispatch to per-app worker pools.
//!
//! Tasks are named `apps.<app_id>.tasks.skill_<skill_id>` and routed to the
//! queue `app_<app_id>`; one worker loop per queue drains sequentially so a
//! slow app cannot starve the others. Handlers are registered explicitly at
//! boot — the gateway registers the pipeline itself for
//! `apps.ai.tasks.skill_ask`; everything else falls back to the HTTP skill
//! handler.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use convoy_core::types::TaskStatus;

pub fn task_name(app_id: &str, skill_id: &str) -> String {
    format!("apps.{app_id}.tasks.skill_{skill_id}")
}

pub fn queue_name(app_id: &str) -> String {
    format!("app_{app_id}")
}

/// A queued unit of work. `kwargs` carries `{arguments, _chat_id?,
/// _message_id?}`; chained follow-ups additionally receive
/// `parent_result`.
#[derive(Debug, Clone)]
pub struct TaskEnvelope {
    pub task_id: String,
    pub name: String,
    pub queue: String,
    pub kwargs: Value,
}

pub type TaskResult = Result<Value, String>;

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, task: &TaskEnvelope) -> TaskResult;
}

#[derive(Debug, Clone)]
enum TaskState {
    Pending,
    Processing,
    Completed(Value),
    Failed(String),
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct TaskStatusReport {
    pub status: TaskStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
}

pub struct TaskDispatcher {
    default_handler: Arc<dyn TaskHandler>,
    handlers: DashMap<String, Arc<dyn TaskHandler>>,
    queues: DashMap<String, mpsc::UnboundedSender<TaskEnvelope>>,
    states: DashMap<String, TaskState>,
    followups: DashMap<String, Arc<dyn TaskHandler>>,
    revoked: DashMap<String, ()>,
}

impl TaskDispatcher {
    pub fn new(default_handler: Arc<dyn TaskHandler>) -> Arc<Self> {
        Arc::new(Self {
            default_handler,
            handlers: DashMap::new(),
            queues: DashMap::new(),
            states: DashMap::new(),
            followups: DashMap::new(),
            revoked: DashMap::new(),
        })
    }

    /// Register a dedicated handler for one task name.
    pub fn register_handler(&self, task_name: &str, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(task_name.to_string(), handler);
    }

    /// Enqueue a task, optionally delayed by `countdown`. Returns the task
    /// id for status polling.
    pub fn dispatch(
        self: &Arc<Self>,
        app_id: &str,
        skill_id: &str,
        kwargs: Value,
        countdown: Option<Duration>,
    ) -> String {
        self.dispatch_chained(app_id, skill_id, kwargs, countdown, None)
    }

    /// Like [`dispatch`](Self::dispatch) but with a follow-up that runs when
    /// the task completes, receiving the task result as `parent_result`.
    pub fn dispatch_chained(
        self: &Arc<Self>,
        app_id: &str,
        skill_id: &str,
        kwargs: Value,
        countdown: Option<Duration>,
        followup: Option<Arc<dyn TaskHandler>>,
    ) -> String {
        let task_id = Uuid::new_v4().to_string();
        let envelope = TaskEnvelope {
            task_id: task_id.clone(),
            name: task_name(app_id, skill_id),
            queue: queue_name(app_id),
            kwargs,
        };

        self.states.insert(task_id.clone(), TaskState::Pending);
        if let Some(followup) = followup {
            self.followups.insert(task_id.clone(), followup);
        }

        let sender = self.queue_sender(&envelope.queue);
        match countdown {
            Some(delay) => {
                let queue = envelope.queue.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if sender.send(envelope).is_err() {
                        error!(%queue, "queue worker gone, delayed task dropped");
                    }
                });
            }
            None => {
                if sender.send(envelope).is_err() {
                    error!("queue worker gone, task dropped");
                    self.states
                        .insert(task_id.clone(), TaskState::Failed("queue unavailable".into()));
                }
            }
        }

        debug!(%task_id, app_id, skill_id, "task dispatched");
        task_id
    }

    pub fn status(&self, task_id: &str) -> TaskStatusReport {
        match self.states.get(task_id).map(|s| s.clone()) {
            Some(TaskState::Pending) => report(TaskStatus::Pending, None, None),
            Some(TaskState::Processing) => report(TaskStatus::Processing, None, None),
            Some(TaskState::Completed(v)) => report(TaskStatus::Completed, Some(v), None),
            Some(TaskState::Failed(e)) => report(TaskStatus::Failed, None, Some(e)),
            Some(TaskState::Cancelled) => report(TaskStatus::Cancelled, None, None),
            None => report(TaskStatus::Unknown, None, None),
        }
    }

    /// Mark a task revoked. A queued task is dropped when its worker picks
    /// it up; a running ask-task observes the bit through its run token.
    pub fn revoke(&self, task_id: &str) -> bool {
        let known = self.states.contains_key(task_id);
        self.revoked.insert(task_id.to_string(), ());
        if known {
            info!(%task_id, "task revoked");
        }
        known
    }

    pub fn is_revoked(&self, task_id: &str) -> bool {
        self.revoked.contains_key(task_id)
    }

    fn queue_sender(self: &Arc<Self>, queue: &str) -> mpsc::UnboundedSender<TaskEnvelope> {
        if let Some(sender) = self.queues.get(queue) {
            return sender.clone();
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.queues.insert(queue.to_string(), tx.clone());
        let dispatcher = Arc::clone(self);
        let queue = queue.to_string();
        tokio::spawn(async move {
            dispatcher.worker_loop(queue, rx).await;
        });
        tx
    }

    async fn worker_loop(
        self: Arc<Self>,
        queue: String,
        mut rx: mpsc::UnboundedReceiver<TaskEnvelope>,
    ) {
        debug!(%queue, "queue worker started");
        while let Some(task) = rx.recv().await {
            if self.is_revoked(&task.task_id) {
                self.states
                    .insert(task.task_id.clone(), TaskState::Cancelled);
                continue;
            }
            self.states
                .insert(task.task_id.clone(), TaskState::Processing);

            let handler = self
                .handlers
                .get(&task.name)
                .map(|h| Arc::clone(h.value()))
                .unwrap_or_else(|| Arc::clone(&self.default_handler));

            let outcome = handler.run(&task).await;
            let state = match &outcome {
                Ok(v) => TaskState::Completed(v.clone()),
                Err(e) => {
                    warn!(task_id = %task.task_id, name = %task.name, error = %e, "task failed");
                    TaskState::Failed(e.clone())
                }
            };
            // Revocation that raced the execution wins in the status report.
            let state = if self.is_revoked(&task.task_id) {
                TaskState::Cancelled
            } else {
                state
            };
            self.states.insert(task.task_id.clone(), state);

            if let Some((_, followup)) = self.followups.remove(&task.task_id) {
                let mut kwargs = task.kwargs.clone();
                if let Value::Object(map) = &mut kwargs {
                    map.insert(
                        "parent_result".to_string(),
                        match outcome {
                            Ok(v) => v,
                            Err(e) => serde_json::json!({"error": e}),
                        },
                    );
                }
                let followup_task = TaskEnvelope {
                    task_id: format!("{}-followup", task.task_id),
                    name: format!("{}.followup", task.name),
                    queue: task.queue.clone(),
                    kwargs,
                };
                if let Err(e) = followup.run(&followup_task).await {
                    warn!(task_id = %followup_task.task_id, error = %e, "followup failed");
                }
            }
        }
        debug!(%queue, "queue worker stopped");
    }
}

fn report(status: TaskStatus, result: Option<Value>, error: Option<String>) -> TaskStatusReport {
    TaskStatusReport {
        status,
        result,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoHandler;

    #[async_trait]
    impl TaskHandler for EchoHandler {
        async fn run(&self, task: &TaskEnvelope) -> TaskResult {
            Ok(json!({"echo": task.kwargs.clone()}))
        }
    }

    struct FailHandler;

    #[async_trait]
    impl TaskHandler for FailHandler {
        async fn run(&self, _task: &TaskEnvelope) -> TaskResult {
            Err("boom".to_string())
        }
    }

    struct CountingFollowup(Arc<AtomicUsize>);

    #[async_trait]
    impl TaskHandler for CountingFollowup {
        async fn run(&self, task: &TaskEnvelope) -> TaskResult {
            assert!(task.kwargs.get("parent_result").is_some());
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        }
    }

    async fn wait_for_terminal(dispatcher: &TaskDispatcher, task_id: &str) -> TaskStatusReport {
        for _ in 0..100 {
            let report = dispatcher.status(task_id);
            if !matches!(report.status, TaskStatus::Pending | TaskStatus::Processing) {
                return report;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        dispatcher.status(task_id)
    }

    #[tokio::test]
    async fn dispatch_completes_with_result() {
        let dispatcher = TaskDispatcher::new(Arc::new(EchoHandler));
        let task_id = dispatcher.dispatch("web", "search", json!({"arguments": {"q": "x"}}), None);
        let report = wait_for_terminal(&dispatcher, &task_id).await;
        assert_eq!(report.status, TaskStatus::Completed);
        assert!(report.result.unwrap()["echo"]["arguments"]["q"] == "x");
    }

    #[tokio::test]
    async fn named_handler_overrides_default() {
        let dispatcher = TaskDispatcher::new(Arc::new(EchoHandler));
        dispatcher.register_handler(&task_name("ai", "ask"), Arc::new(FailHandler));
        let task_id = dispatcher.dispatch("ai", "ask", json!({"arguments": {}}), None);
        let report = wait_for_terminal(&dispatcher, &task_id).await;
        assert_eq!(report.status, TaskStatus::Failed);
        assert_eq!(report.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn revoked_before_pickup_is_cancelled() {
        let dispatcher = TaskDispatcher::new(Arc::new(EchoHandler));
        let task_id = dispatcher.dispatch(
            "slow",
            "thing",
            json!({"arguments": {}}),
            Some(Duration::from_millis(30)),
        );
        assert!(dispatcher.revoke(&task_id));
        let report = wait_for_terminal(&dispatcher, &task_id).await;
        assert_eq!(report.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn unknown_task_reports_unknown() {
        let dispatcher = TaskDispatcher::new(Arc::new(EchoHandler));
        assert_eq!(dispatcher.status("nope").status, TaskStatus::Unknown);
    }

    #[tokio::test]
    async fn chained_followup_runs_with_parent_result() {
        let dispatcher = TaskDispatcher::new(Arc::new(EchoHandler));
        let count = Arc::new(AtomicUsize::new(0));
        let task_id = dispatcher.dispatch_chained(
            "web",
            "search",
            json!({"arguments": {}}),
            None,
            Some(Arc::new(CountingFollowup(Arc::clone(&count)))),
        );
        wait_for_terminal(&dispatcher, &task_id).await;
        // Followup runs after the parent completes.
        for _ in 0..100 {
            if count.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
