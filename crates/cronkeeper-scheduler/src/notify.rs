//! Completion webhooks, sent once a run's final attempt has been recorded.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Result, SchedulerError},
    types::{ExecutionRecord, NotifyPolicy, Outcome, Task},
};

/// JSON body of a completion webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub task: String,
    pub outcome: Outcome,
    pub exit_code: i32,
    /// Number of the attempt that ended the run.
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stdout: String,
    pub stderr: String,
    pub command: String,
    pub trigger: String,
}

impl CompletionEvent {
    pub fn new(task: &Task, record: &ExecutionRecord) -> Self {
        Self {
            task: task.name.clone(),
            outcome: record.outcome,
            exit_code: record.exit_code,
            attempt: record.attempt,
            started_at: record.started_at,
            finished_at: record.finished_at,
            stdout: record.stdout.clone(),
            stderr: record.stderr.clone(),
            command: task.command.clone(),
            trigger: task.trigger.clone(),
        }
    }
}

/// Delivers completion events. Implementations must not retry forever; the
/// dispatcher logs a returned error and moves on.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, policy: &NotifyPolicy, event: &CompletionEvent) -> Result<()>;
}

/// `POST`s the event as JSON to the policy URL.
pub struct WebhookNotifier {
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("cronkeeper/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, policy: &NotifyPolicy, event: &CompletionEvent) -> Result<()> {
        let mut request = self.client.post(&policy.url).json(event);
        if let Some(token) = &policy.token {
            request = request.bearer_auth(token);
        }

        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SchedulerError::Webhook(format!(
                "{} answered {status}",
                policy.url
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskSpec;
    use chrono::TimeZone;

    fn record(outcome: Outcome) -> ExecutionRecord {
        let started_at = Utc.with_ymd_and_hms(2026, 10, 19, 3, 0, 0).unwrap();
        ExecutionRecord {
            id: "r1".into(),
            task_name: "nightly".into(),
            attempt: 3,
            started_at,
            finished_at: started_at + chrono::Duration::seconds(2),
            exit_code: 1,
            outcome,
            stdout: String::new(),
            stderr: "disk full".into(),
        }
    }

    #[test]
    fn event_describes_the_final_attempt() {
        let (task, _) = TaskSpec::new("nightly", "0 3 * * *", "backup.sh")
            .build(Utc::now())
            .unwrap();
        let event = CompletionEvent::new(&task, &record(Outcome::Failed));
        assert_eq!(event.attempt, 3);
        assert_eq!(event.trigger, "0 3 * * *");

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["outcome"], "failed");
        assert_eq!(json["stderr"], "disk full");
        assert_eq!(json["command"], "backup.sh");
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_webhook_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/hook", listener.local_addr().unwrap());
        drop(listener);

        let (task, _) = TaskSpec::new("t", "@daily", "true").build(Utc::now()).unwrap();
        let notifier = WebhookNotifier::new(Duration::from_secs(2)).unwrap();
        let err = notifier
            .notify(
                &NotifyPolicy::new(url),
                &CompletionEvent::new(&task, &record(Outcome::Failed)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "WEBHOOK_ERROR");
    }
}
