//! Queue operations: swarm creation, atomic claim, state transitions, and
//! maintenance queries.
//!
//! The single serialization point for task ownership is the conditional
//! update `WHERE id = ? AND status = 'pending'`; a claim that changed no row
//! lost the race and moves on.

use rusqlite::{Connection, OptionalExtension, params};
use serde_json::json;
use tracing::info;

use super::{SwarmStatus, SwarmTask, TaskEvent, TaskMode, TaskSpec, TaskStatus, depends_on_of};
use crate::core::error::{CoreError, Result};
use crate::core::{Core, now_iso, now_iso_at, random_hex};

const TASK_COLUMNS: &str = "id, swarm_id, seq, description, prompt, status, agent_id, model, \
                            strategy, mode, result, error, created_at, claimed_at, completed_at, \
                            metadata";

fn task_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SwarmTask> {
    let status: String = row.get(5)?;
    let mode: String = row.get(9)?;
    let metadata: String = row.get(15)?;
    Ok(SwarmTask {
        id: row.get(0)?,
        swarm_id: row.get(1)?,
        seq: row.get(2)?,
        description: row.get(3)?,
        prompt: row.get(4)?,
        status: TaskStatus::from_status(&status).unwrap_or(TaskStatus::Pending),
        agent_id: row.get(6)?,
        model: row.get(7)?,
        strategy: row.get(8)?,
        mode: TaskMode::from_mode(&mode),
        result: row.get(10)?,
        error: row.get(11)?,
        created_at: row.get(12)?,
        claimed_at: row.get(13)?,
        completed_at: row.get(14)?,
        metadata: serde_json::from_str(&metadata).unwrap_or_else(|_| json!({})),
    })
}

fn fetch_task(conn: &Connection, id: &str) -> rusqlite::Result<Option<SwarmTask>> {
    conn.query_row(
        &format!("SELECT {} FROM swarm_tasks WHERE id = ?1", TASK_COLUMNS),
        params![id],
        task_from_row,
    )
    .optional()
}

impl Core {
    /// Insert a set of tasks as one swarm, in one transaction, preserving
    /// insertion order as `seq`. Returns the swarm id and the task ids.
    pub async fn create_swarm(
        &self,
        swarm_id: Option<String>,
        tasks: Vec<TaskSpec>,
    ) -> Result<(String, Vec<String>)> {
        let swarm_id = swarm_id.unwrap_or_else(|| random_hex(8));
        let now = now_iso();

        let mut conn = self.inner.swarm_db.lock().await;
        let tx = conn.transaction()?;
        let mut task_ids = Vec::with_capacity(tasks.len());
        for (seq, spec) in tasks.iter().enumerate() {
            let id = format!("{}-task-{}", swarm_id, seq);
            let prompt = spec.prompt.clone().unwrap_or_else(|| spec.description.clone());
            let metadata = spec.metadata.clone().unwrap_or_else(|| json!({}));
            tx.execute(
                "INSERT INTO swarm_tasks (id, swarm_id, seq, description, prompt, status, \
                 model, strategy, mode, created_at, metadata) \
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7, ?8, ?9, ?10)",
                params![
                    id,
                    swarm_id,
                    seq as i64,
                    spec.description,
                    prompt,
                    spec.model,
                    spec.strategy,
                    spec.mode.as_str(),
                    now,
                    metadata.to_string(),
                ],
            )?;
            task_ids.push(id);
        }
        tx.commit()?;
        info!("created swarm {} with {} tasks", swarm_id, task_ids.len());
        Ok((swarm_id, task_ids))
    }

    /// Claim the next pending task in a swarm for `agent_id`.
    ///
    /// With `check_deps`, only tasks whose `depends_on` entries are all done
    /// are considered. Returns `None` when nothing is claimable (or every
    /// candidate was lost to a racing worker).
    pub async fn claim_task(
        &self,
        swarm_id: &str,
        agent_id: &str,
        check_deps: bool,
    ) -> Result<Option<SwarmTask>> {
        let claimed = {
            let conn = self.inner.swarm_db.lock().await;
            let mut stmt = conn.prepare(
                "SELECT id, metadata FROM swarm_tasks \
                 WHERE swarm_id = ?1 AND status = 'pending' ORDER BY seq ASC",
            )?;
            let candidates: Vec<(String, String)> = stmt
                .query_map(params![swarm_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<_>>()?;
            drop(stmt);

            let mut claimed = None;
            for (id, metadata) in candidates {
                if check_deps {
                    let meta = serde_json::from_str(&metadata).unwrap_or_else(|_| json!({}));
                    if !deps_satisfied(&conn, swarm_id, &depends_on_of(&meta))? {
                        continue;
                    }
                }
                let changed = conn.execute(
                    "UPDATE swarm_tasks SET status = 'claimed', agent_id = ?1, claimed_at = ?2 \
                     WHERE id = ?3 AND status = 'pending'",
                    params![agent_id, now_iso(), id],
                )?;
                if changed == 1 {
                    claimed = fetch_task(&conn, &id)?;
                    break;
                }
            }
            claimed
        };

        if let Some(task) = &claimed {
            self.inner.hooks.emit(&TaskEvent::Claimed(task.clone()));
        }
        Ok(claimed)
    }

    /// Claim one specific task. Used by the executor, where task identity is
    /// fixed by the level plan; the same conditional update keeps it safe
    /// against external workers.
    pub async fn claim_task_by_id(
        &self,
        task_id: &str,
        agent_id: &str,
    ) -> Result<Option<SwarmTask>> {
        let claimed = {
            let conn = self.inner.swarm_db.lock().await;
            let changed = conn.execute(
                "UPDATE swarm_tasks SET status = 'claimed', agent_id = ?1, claimed_at = ?2 \
                 WHERE id = ?3 AND status = 'pending'",
                params![agent_id, now_iso(), task_id],
            )?;
            if changed == 1 {
                fetch_task(&conn, task_id)?
            } else {
                None
            }
        };
        if let Some(task) = &claimed {
            self.inner.hooks.emit(&TaskEvent::Claimed(task.clone()));
        }
        Ok(claimed)
    }

    /// Move a claimed task to running.
    pub async fn mark_running(&self, task_id: &str) -> Result<SwarmTask> {
        let conn = self.inner.swarm_db.lock().await;
        let changed = conn.execute(
            "UPDATE swarm_tasks SET status = 'running' WHERE id = ?1 AND status = 'claimed'",
            params![task_id],
        )?;
        let task = fetch_task(&conn, task_id)?
            .ok_or_else(|| CoreError::TaskNotFound(task_id.to_string()))?;
        if changed == 0 {
            return Err(CoreError::Invalid(format!(
                "task {} is {}, expected claimed",
                task_id,
                task.status.as_str()
            )));
        }
        Ok(task)
    }

    /// Finish a task successfully, storing its result.
    pub async fn complete_task(&self, task_id: &str, result: &str) -> Result<SwarmTask> {
        let task = self
            .transition_terminal(task_id, TaskStatus::Done, Some(result), None)
            .await?;
        self.inner.hooks.emit(&TaskEvent::Completed(task.clone()));
        Ok(task)
    }

    /// Finish a task as failed, storing the error.
    pub async fn fail_task(&self, task_id: &str, error: &str) -> Result<SwarmTask> {
        let task = self
            .transition_terminal(task_id, TaskStatus::Failed, None, Some(error))
            .await?;
        self.inner.hooks.emit(&TaskEvent::Failed(task.clone()));
        Ok(task)
    }

    async fn transition_terminal(
        &self,
        task_id: &str,
        to: TaskStatus,
        result: Option<&str>,
        error: Option<&str>,
    ) -> Result<SwarmTask> {
        let now = now_iso();
        let conn = self.inner.swarm_db.lock().await;
        // A failure may land on a task that was never claimed (dependency
        // failures, cycle defense); completion requires a prior claim.
        let changed = match to {
            TaskStatus::Done => conn.execute(
                "UPDATE swarm_tasks SET status = 'done', result = ?2, error = NULL, \
                 completed_at = ?3, claimed_at = COALESCE(claimed_at, ?3) \
                 WHERE id = ?1 AND status IN ('claimed', 'running')",
                params![task_id, result, now],
            )?,
            TaskStatus::Failed => conn.execute(
                "UPDATE swarm_tasks SET status = 'failed', error = ?2, \
                 completed_at = ?3, claimed_at = COALESCE(claimed_at, ?3) \
                 WHERE id = ?1 AND status IN ('pending', 'claimed', 'running')",
                params![task_id, error, now],
            )?,
            _ => 0,
        };
        let task = fetch_task(&conn, task_id)?
            .ok_or_else(|| CoreError::TaskNotFound(task_id.to_string()))?;
        if changed == 0 {
            return Err(CoreError::Invalid(format!(
                "task {} is {}, cannot transition to {}",
                task_id,
                task.status.as_str(),
                to.as_str()
            )));
        }
        Ok(task)
    }

    /// Force a non-terminal task back to pending, clearing ownership.
    pub async fn reset_task(&self, task_id: &str) -> Result<SwarmTask> {
        let task = {
            let conn = self.inner.swarm_db.lock().await;
            let changed = conn.execute(
                "UPDATE swarm_tasks SET status = 'pending', agent_id = NULL, claimed_at = NULL \
                 WHERE id = ?1 AND status IN ('pending', 'claimed', 'running')",
                params![task_id],
            )?;
            let task = fetch_task(&conn, task_id)?
                .ok_or_else(|| CoreError::TaskNotFound(task_id.to_string()))?;
            if changed == 0 {
                return Err(CoreError::Invalid(format!(
                    "task {} is {}, terminal tasks cannot be reset",
                    task_id,
                    task.status.as_str()
                )));
            }
            task
        };
        self.inner.hooks.emit(&TaskEvent::Reset(task.clone()));
        Ok(task)
    }

    pub async fn get_task(&self, task_id: &str) -> Result<SwarmTask> {
        let conn = self.inner.swarm_db.lock().await;
        fetch_task(&conn, task_id)?.ok_or_else(|| CoreError::TaskNotFound(task_id.to_string()))
    }

    pub async fn get_swarm_status(&self, swarm_id: &str) -> Result<SwarmStatus> {
        let conn = self.inner.swarm_db.lock().await;
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM swarm_tasks WHERE swarm_id = ?1 GROUP BY status",
        )?;
        let rows = stmt.query_map(params![swarm_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u32))
        })?;
        let mut status = SwarmStatus::default();
        for row in rows {
            let (name, count) = row?;
            status.total += count;
            match TaskStatus::from_status(&name) {
                Some(TaskStatus::Pending) => status.pending = count,
                Some(TaskStatus::Claimed) => status.claimed = count,
                Some(TaskStatus::Running) => status.running = count,
                Some(TaskStatus::Done) => status.done = count,
                Some(TaskStatus::Failed) => status.failed = count,
                None => {}
            }
        }
        Ok(status)
    }

    /// All tasks of a swarm in seq order.
    pub async fn get_swarm_results(&self, swarm_id: &str) -> Result<Vec<SwarmTask>> {
        let conn = self.inner.swarm_db.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM swarm_tasks WHERE swarm_id = ?1 ORDER BY seq ASC",
            TASK_COLUMNS
        ))?;
        let rows = stmt.query_map(params![swarm_id], task_from_row)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(tasks)
    }

    /// True when the swarm has at least one task and all are terminal.
    pub async fn is_swarm_complete(&self, swarm_id: &str) -> Result<bool> {
        let status = self.get_swarm_status(swarm_id).await?;
        Ok(status.total > 0 && status.pending + status.claimed + status.running == 0)
    }

    /// Claimed or running tasks whose claim is older than the cutoff;
    /// candidates for an external recovery job to reset.
    pub async fn get_stale_tasks(&self, stale_minutes: i64) -> Result<Vec<SwarmTask>> {
        let cutoff = now_iso_at(chrono::Utc::now() - chrono::Duration::minutes(stale_minutes));
        let conn = self.inner.swarm_db.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM swarm_tasks \
             WHERE status IN ('claimed', 'running') AND claimed_at IS NOT NULL \
               AND claimed_at < ?1 ORDER BY claimed_at ASC",
            TASK_COLUMNS
        ))?;
        let rows = stmt.query_map(params![cutoff], task_from_row)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(tasks)
    }

    /// Delete swarms where every task is terminal and the newest completion
    /// is older than the retention window. Returns deleted row count.
    pub async fn clean_completed_swarms(&self, retention_days: i64) -> Result<usize> {
        let cutoff = now_iso_at(chrono::Utc::now() - chrono::Duration::days(retention_days));
        let mut conn = self.inner.swarm_db.lock().await;
        let tx = conn.transaction()?;
        let swarm_ids: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT swarm_id FROM swarm_tasks \
                 GROUP BY swarm_id \
                 HAVING SUM(CASE WHEN status IN ('done', 'failed') THEN 0 ELSE 1 END) = 0 \
                    AND MAX(completed_at) < ?1",
            )?;
            let rows = stmt.query_map(params![cutoff], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        let mut deleted = 0;
        for swarm_id in &swarm_ids {
            deleted += tx.execute(
                "DELETE FROM swarm_tasks WHERE swarm_id = ?1",
                params![swarm_id],
            )?;
        }
        tx.commit()?;
        if deleted > 0 {
            info!("cleaned {} tasks from {} completed swarms", deleted, swarm_ids.len());
        }
        Ok(deleted)
    }
}

fn deps_satisfied(conn: &Connection, swarm_id: &str, deps: &[i64]) -> rusqlite::Result<bool> {
    for dep in deps {
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM swarm_tasks WHERE swarm_id = ?1 AND seq = ?2",
                params![swarm_id, dep],
                |row| row.get(0),
            )
            .optional()?;
        if status.as_deref() != Some("done") {
            return Ok(false);
        }
    }
    Ok(true)
}
