use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::{Duration, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::cursor::{Agent, TaskApi};
use crate::db::{call_blocking, Database, TaskRecord};
use crate::runtime::AppState;
use crate::task::TaskStatus;
use crate::text::preview;
use crate::tools::button_message::{Button, ButtonMessage};

/// Outbound side of the monitor: delivers a notification to a chat.
#[async_trait]
pub trait ChatNotifier: Send + Sync {
    async fn notify(&self, chat_id: i64, message: &ButtonMessage) -> anyhow::Result<()>;
}

pub fn spawn_task_monitor(
    state: Arc<AppState>,
    notifier: Arc<dyn ChatNotifier>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let every = Duration::from_secs(state.config.task_monitor_interval_secs);
        info!("Task monitor started (every {}s)", every.as_secs());
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let sent = run_monitor_cycle(&state.db, state.api.as_ref(), notifier.as_ref()).await;
            if sent > 0 {
                info!("Task monitor: sent {sent} notification(s)");
            }
        }
    })
}

/// Poll every active task once. Returns how many notifications were sent.
pub async fn run_monitor_cycle(
    db: &Arc<Database>,
    api: &dyn TaskApi,
    notifier: &dyn ChatNotifier,
) -> usize {
    let tasks = match call_blocking(db.clone(), |db| db.get_all_active_tasks()).await {
        Ok(tasks) => tasks,
        Err(e) => {
            error!("Task monitor: failed to load active tasks: {e}");
            return 0;
        }
    };

    let mut sent = 0;
    for task in tasks {
        let agent = match api.get_agent(&task.composer_id).await {
            Ok(agent) => agent,
            Err(e) => {
                warn!("Task monitor: failed to fetch {}: {e}", task.composer_id);
                continue;
            }
        };
        if agent.status == task.status {
            continue;
        }

        let composer_id = task.composer_id.clone();
        let status = agent.status.clone();
        let changed = match call_blocking(db.clone(), move |db| {
            db.update_task_status(&composer_id, &status)
        })
        .await
        {
            Ok(changed) => changed,
            Err(e) => {
                warn!(
                    "Task monitor: failed to store status of {}: {e}",
                    task.composer_id
                );
                continue;
            }
        };
        if !changed {
            continue;
        }

        info!(
            "Task {} changed {} -> {}",
            task.composer_id, task.status, agent.status
        );
        let message = status_notification(&task, &agent);
        match notifier.notify(task.chat_id, &message).await {
            Ok(()) => sent += 1,
            Err(e) => warn!(
                "Task monitor: failed to notify chat {} about {}: {e}",
                task.chat_id, task.composer_id
            ),
        }
    }
    sent
}

pub fn status_headline(status: &TaskStatus) -> String {
    match status {
        TaskStatus::Finished => "✅ Task completed".to_string(),
        TaskStatus::Error => "❌ Task failed".to_string(),
        TaskStatus::Expired => "⌛ Task expired".to_string(),
        TaskStatus::Cancelled => "🛑 Task cancelled".to_string(),
        TaskStatus::Running => "🔄 Task is running".to_string(),
        other => format!("ℹ️ Task status: {other}"),
    }
}

pub fn status_notification(task: &TaskRecord, agent: &Agent) -> ButtonMessage {
    let mut text = format!(
        "{}\n\n📝 {}\n📦 {}",
        status_headline(&agent.status),
        preview(&task.task_description, 300),
        task.repo_url
    );
    if let Some(summary) = agent.summary.as_deref().filter(|s| !s.trim().is_empty()) {
        text.push_str(&format!("\n\n{}", preview(summary.trim(), 1000)));
    }
    if let Some(pr_url) = agent.target.as_ref().and_then(|t| t.pr_url.as_deref()) {
        text.push_str(&format!("\n\n🔗 {pr_url}"));
    }

    let mut buttons = vec![Button {
        label: "Open in Cursor".into(),
        url: agent.web_url(),
    }];
    if task.repo_url.starts_with("http://") || task.repo_url.starts_with("https://") {
        buttons.push(Button {
            label: "Repository".into(),
            url: task.repo_url.clone(),
        });
    }
    ButtonMessage { text, buttons }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{temp_db, FakeTaskApi};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<(i64, ButtonMessage)>>,
        fail: bool,
    }

    impl RecordingNotifier {
        fn sent(&self) -> Vec<(i64, ButtonMessage)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChatNotifier for RecordingNotifier {
        async fn notify(&self, chat_id: i64, message: &ButtonMessage) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("chat not found");
            }
            self.sent.lock().unwrap().push((chat_id, message.clone()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_running_to_finished_notifies_once() {
        let (db, dir) = temp_db();
        db.create_task(1, 100, "bc-1", "https://github.com/a/b", "build a login page", &TaskStatus::Running)
            .unwrap();
        let api = FakeTaskApi::new();
        api.set_status("bc-1", TaskStatus::Running);
        let notifier = RecordingNotifier::default();

        assert_eq!(run_monitor_cycle(&db, &api, &notifier).await, 0);

        api.set_status("bc-1", TaskStatus::Finished);
        api.set_summary("bc-1", "Added /login");
        assert_eq!(run_monitor_cycle(&db, &api, &notifier).await, 1);
        // Terminal tasks are no longer polled
        assert_eq!(run_monitor_cycle(&db, &api, &notifier).await, 0);

        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        let (chat_id, message) = &sent[0];
        assert_eq!(*chat_id, 100);
        assert!(message.text.starts_with("✅ Task completed"));
        assert!(message.text.contains("build a login page"));
        assert!(message.text.contains("https://github.com/a/b"));
        assert!(message.text.contains("Added /login"));
        assert_eq!(message.buttons[0].label, "Open in Cursor");
        assert_eq!(message.buttons[0].url, "https://cursor.com/agents?id=bc-1");
        assert_eq!(message.buttons[1].label, "Repository");

        let task = db.get_task_by_composer_id("bc-1").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Finished);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_errors_are_skipped_per_task() {
        let (db, dir) = temp_db();
        db.create_task(1, 100, "bc-1", "https://github.com/a/b", "one", &TaskStatus::Creating)
            .unwrap();
        db.create_task(2, 200, "bc-2", "https://github.com/a/b", "two", &TaskStatus::Creating)
            .unwrap();
        let api = FakeTaskApi::new();
        api.fail_agent("bc-1");
        api.set_status("bc-2", TaskStatus::Running);
        let notifier = RecordingNotifier::default();

        assert_eq!(run_monitor_cycle(&db, &api, &notifier).await, 1);
        let sent = notifier.sent();
        assert_eq!(sent[0].0, 200);
        assert!(sent[0].1.text.starts_with("🔄 Task is running"));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_failed_delivery_does_not_repeat() {
        let (db, dir) = temp_db();
        db.create_task(1, 100, "bc-1", "https://github.com/a/b", "x", &TaskStatus::Running)
            .unwrap();
        let api = FakeTaskApi::new();
        api.set_status("bc-1", TaskStatus::Error);
        let notifier = RecordingNotifier {
            fail: true,
            ..Default::default()
        };

        assert_eq!(run_monitor_cycle(&db, &api, &notifier).await, 0);
        let task = db.get_task_by_composer_id("bc-1").unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Error);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_status_headlines() {
        assert_eq!(status_headline(&TaskStatus::Expired), "⌛ Task expired");
        assert_eq!(status_headline(&TaskStatus::Cancelled), "🛑 Task cancelled");
        assert_eq!(status_headline(&TaskStatus::Error), "❌ Task failed");
        assert_eq!(
            status_headline(&TaskStatus::Other("PAUSED".into())),
            "ℹ️ Task status: PAUSED"
        );
    }
}
