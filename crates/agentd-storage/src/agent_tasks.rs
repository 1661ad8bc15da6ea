//! `agent_tasks` table: the FIFO work queue.

use rusqlite::{OptionalExtension, Row, TransactionBehavior, params};

use agentd_types::{AgentTask, AgentTaskStatus, now_millis};

use crate::{Result, Storage, parse_column};

const COLUMNS: &str =
    "id, description, status, sequence, created_at, updated_at, result_summary, fail_reason";

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<AgentTask> {
    Ok(AgentTask {
        id: row.get(0)?,
        description: row.get(1)?,
        status: parse_column(2, row.get(2)?)?,
        sequence: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
        result_summary: row.get(6)?,
        fail_reason: row.get(7)?,
    })
}

impl Storage {
    /// Insert a `pending` task at the tail of the queue.
    ///
    /// The sequence is `max(sequence) + 1` (or 1 on an empty table), computed
    /// inside the same write transaction as the insert.
    pub async fn insert_agent_task(&self, description: &str) -> Result<AgentTask> {
        let description = description.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let sequence: i64 = tx.query_row(
                "SELECT COALESCE(MAX(sequence), 0) + 1 FROM agent_tasks",
                [],
                |row| row.get(0),
            )?;
            let now = now_millis();
            let task = AgentTask {
                id: uuid::Uuid::new_v4().to_string(),
                description,
                status: AgentTaskStatus::Pending,
                sequence,
                created_at: now,
                updated_at: now,
                result_summary: None,
                fail_reason: None,
            };
            tx.execute(
                "INSERT INTO agent_tasks (id, description, status, sequence, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    task.id,
                    task.description,
                    task.status.as_str(),
                    task.sequence,
                    task.created_at,
                    task.updated_at,
                ],
            )?;
            tx.commit()?;
            Ok(task)
        })
        .await
    }

    pub async fn get_agent_task(&self, id: &str) -> Result<Option<AgentTask>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {COLUMNS} FROM agent_tasks WHERE id = ?1");
            Ok(conn.query_row(&sql, params![id], row_to_task).optional()?)
        })
        .await
    }

    /// All tasks in queue order; `active_only` keeps pending and in-progress ones.
    pub async fn list_agent_tasks(&self, active_only: bool) -> Result<Vec<AgentTask>> {
        self.with_conn(move |conn| {
            let filter = if active_only {
                "WHERE status IN ('pending', 'in_progress')"
            } else {
                ""
            };
            let sql = format!("SELECT {COLUMNS} FROM agent_tasks {filter} ORDER BY sequence ASC");
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([], row_to_task)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Earliest task with the given status, by sequence.
    pub async fn first_agent_task_with_status(
        &self,
        status: AgentTaskStatus,
    ) -> Result<Option<AgentTask>> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {COLUMNS} FROM agent_tasks WHERE status = ?1 ORDER BY sequence ASC LIMIT 1"
            );
            Ok(conn
                .query_row(&sql, params![status.as_str()], row_to_task)
                .optional()?)
        })
        .await
    }

    /// Move a task from `pending` to `in_progress`.
    ///
    /// Returns `None` when the task is missing or no longer pending.
    pub async fn start_agent_task(&self, id: &str) -> Result<Option<AgentTask>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "UPDATE agent_tasks SET status = 'in_progress', updated_at = ?2
                 WHERE id = ?1 AND status = 'pending'
                 RETURNING {COLUMNS}"
            );
            Ok(conn
                .query_row(&sql, params![id, now_millis()], row_to_task)
                .optional()?)
        })
        .await
    }

    /// Record the terminal outcome of an in-progress task.
    ///
    /// Terminal states are written once: returns `None` if the task is not
    /// currently `in_progress`.
    pub async fn finish_agent_task(
        &self,
        id: &str,
        status: AgentTaskStatus,
        result_summary: Option<String>,
        fail_reason: Option<String>,
    ) -> Result<Option<AgentTask>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "UPDATE agent_tasks
                 SET status = ?2, result_summary = ?3, fail_reason = ?4, updated_at = ?5
                 WHERE id = ?1 AND status = 'in_progress'
                 RETURNING {COLUMNS}"
            );
            Ok(conn
                .query_row(
                    &sql,
                    params![id, status.as_str(), result_summary, fail_reason, now_millis()],
                    row_to_task,
                )
                .optional()?)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sequences_increase_by_one() {
        let storage = Storage::open_in_memory().unwrap();
        let a = storage.insert_agent_task("a").await.unwrap();
        let b = storage.insert_agent_task("b").await.unwrap();
        let c = storage.insert_agent_task("c").await.unwrap();
        assert_eq!((a.sequence, b.sequence, c.sequence), (1, 2, 3));
        assert_eq!(a.status, AgentTaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_first_pending_follows_sequence() {
        let storage = Storage::open_in_memory().unwrap();
        let a = storage.insert_agent_task("a").await.unwrap();
        storage.insert_agent_task("b").await.unwrap();

        let first = storage
            .first_agent_task_with_status(AgentTaskStatus::Pending)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.id, a.id);
    }

    #[tokio::test]
    async fn test_start_only_from_pending() {
        let storage = Storage::open_in_memory().unwrap();
        let task = storage.insert_agent_task("a").await.unwrap();

        let started = storage.start_agent_task(&task.id).await.unwrap().unwrap();
        assert_eq!(started.status, AgentTaskStatus::InProgress);
        assert!(storage.start_agent_task(&task.id).await.unwrap().is_none());
        assert!(storage.start_agent_task("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_finish_is_written_once() {
        let storage = Storage::open_in_memory().unwrap();
        let task = storage.insert_agent_task("a").await.unwrap();

        // Not in progress yet
        let early = storage
            .finish_agent_task(&task.id, AgentTaskStatus::Completed, None, None)
            .await
            .unwrap();
        assert!(early.is_none());

        storage.start_agent_task(&task.id).await.unwrap();
        let done = storage
            .finish_agent_task(
                &task.id,
                AgentTaskStatus::Completed,
                Some("all good".into()),
                None,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, AgentTaskStatus::Completed);
        assert_eq!(done.result_summary.as_deref(), Some("all good"));

        let again = storage
            .finish_agent_task(&task.id, AgentTaskStatus::Failed, None, Some("late".into()))
            .await
            .unwrap();
        assert!(again.is_none());
        let loaded = storage.get_agent_task(&task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, AgentTaskStatus::Completed);
        assert!(loaded.fail_reason.is_none());
    }

    #[tokio::test]
    async fn test_list_active_excludes_terminal() {
        let storage = Storage::open_in_memory().unwrap();
        let a = storage.insert_agent_task("a").await.unwrap();
        let b = storage.insert_agent_task("b").await.unwrap();
        storage.start_agent_task(&a.id).await.unwrap();
        storage
            .finish_agent_task(&a.id, AgentTaskStatus::Failed, None, Some("boom".into()))
            .await
            .unwrap();

        let active = storage.list_agent_tasks(true).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, b.id);

        let all = storage.list_agent_tasks(false).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].fail_reason.as_deref(), Some("boom"));
    }
}
