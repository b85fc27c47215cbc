//! Task lifecycle events delivered to registered hooks.
//!
//! Hooks observe state transitions; they never influence them. A panicking
//! hook is caught and logged so one bad subscriber cannot poison the queue.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::RwLock;

use tracing::warn;

use super::SwarmTask;

#[derive(Debug, Clone)]
pub enum TaskEvent {
    Claimed(SwarmTask),
    Completed(SwarmTask),
    Failed(SwarmTask),
    Reset(SwarmTask),
}

impl TaskEvent {
    pub fn task(&self) -> &SwarmTask {
        match self {
            TaskEvent::Claimed(t)
            | TaskEvent::Completed(t)
            | TaskEvent::Failed(t)
            | TaskEvent::Reset(t) => t,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TaskEvent::Claimed(_) => "claimed",
            TaskEvent::Completed(_) => "completed",
            TaskEvent::Failed(_) => "failed",
            TaskEvent::Reset(_) => "reset",
        }
    }
}

type Hook = Box<dyn Fn(&TaskEvent) + Send + Sync>;

#[derive(Default)]
pub struct TaskHooks {
    hooks: RwLock<Vec<Hook>>,
}

impl TaskHooks {
    pub fn subscribe<F>(&self, hook: F)
    where
        F: Fn(&TaskEvent) + Send + Sync + 'static,
    {
        self.hooks
            .write()
            .expect("task hook registry poisoned")
            .push(Box::new(hook));
    }

    pub(crate) fn emit(&self, event: &TaskEvent) {
        let hooks = self.hooks.read().expect("task hook registry poisoned");
        for hook in hooks.iter() {
            if catch_unwind(AssertUnwindSafe(|| hook(event))).is_err() {
                warn!(
                    "task hook panicked on '{}' event for {}",
                    event.kind(),
                    event.task().id
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::swarm::{TaskMode, TaskStatus};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample_task() -> SwarmTask {
        SwarmTask {
            id: "s-task-0".to_string(),
            swarm_id: "s".to_string(),
            seq: 0,
            description: "d".to_string(),
            prompt: "p".to_string(),
            status: TaskStatus::Claimed,
            agent_id: Some("a".to_string()),
            model: None,
            strategy: None,
            mode: TaskMode::Inline,
            result: None,
            error: None,
            created_at: "2026-01-01T00:00:00.000Z".to_string(),
            claimed_at: Some("2026-01-01T00:00:01.000Z".to_string()),
            completed_at: None,
            metadata: serde_json::json!({}),
        }
    }

    #[test]
    fn all_subscribers_receive_the_event() {
        let hooks = TaskHooks::default();
        let seen = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let seen = seen.clone();
            hooks.subscribe(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            });
        }
        hooks.emit(&TaskEvent::Claimed(sample_task()));
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn panicking_hook_does_not_stop_later_hooks() {
        let hooks = TaskHooks::default();
        hooks.subscribe(|_| panic!("bad subscriber"));
        let seen = Arc::new(AtomicUsize::new(0));
        {
            let seen = seen.clone();
            hooks.subscribe(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            });
        }
        hooks.emit(&TaskEvent::Failed(sample_task()));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn event_kind_matches_variant() {
        assert_eq!(TaskEvent::Claimed(sample_task()).kind(), "claimed");
        assert_eq!(TaskEvent::Completed(sample_task()).kind(), "completed");
        assert_eq!(TaskEvent::Failed(sample_task()).kind(), "failed");
        assert_eq!(TaskEvent::Reset(sample_task()).kind(), "reset");
    }
}
