//! `scheduled_tasks` table: timed trigger definitions.

use rusqlite::{OptionalExtension, Row, params};

use agentd_types::{ScheduledTask, ScheduledTaskStatus, now_millis};

use crate::{Result, Storage, parse_column};

const COLUMNS: &str = "id, description, type, schedule, status, next_run_time, last_run_time, \
                       created_at, updated_at, created_by, fail_reason";

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<ScheduledTask> {
    Ok(ScheduledTask {
        id: row.get(0)?,
        description: row.get(1)?,
        task_type: parse_column(2, row.get(2)?)?,
        schedule: row.get(3)?,
        status: parse_column(4, row.get(4)?)?,
        next_run_time: row.get(5)?,
        last_run_time: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
        created_by: parse_column(9, row.get(9)?)?,
        fail_reason: row.get(10)?,
    })
}

impl Storage {
    pub async fn insert_scheduled_task(&self, task: &ScheduledTask) -> Result<()> {
        let task = task.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO scheduled_tasks
                    (id, description, type, schedule, status, next_run_time, last_run_time,
                     created_at, updated_at, created_by, fail_reason)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    task.id,
                    task.description,
                    task.task_type.as_str(),
                    task.schedule,
                    task.status.as_str(),
                    task.next_run_time,
                    task.last_run_time,
                    task.created_at,
                    task.updated_at,
                    task.created_by.as_str(),
                    task.fail_reason,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_scheduled_task(&self, id: &str) -> Result<Option<ScheduledTask>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {COLUMNS} FROM scheduled_tasks WHERE id = ?1");
            Ok(conn.query_row(&sql, params![id], row_to_task).optional()?)
        })
        .await
    }

    /// All scheduled tasks ordered by next run time; `active_only` filters on status.
    pub async fn list_scheduled_tasks(&self, active_only: bool) -> Result<Vec<ScheduledTask>> {
        let filter = if active_only {
            "WHERE status = 'active'"
        } else {
            ""
        };
        let sql = format!("SELECT {COLUMNS} FROM scheduled_tasks {filter} ORDER BY next_run_time ASC");
        self.query_scheduled(sql, Vec::new()).await
    }

    /// Active tasks whose next run is strictly after `now`.
    pub async fn list_upcoming_scheduled_tasks(&self, now: i64) -> Result<Vec<ScheduledTask>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM scheduled_tasks
             WHERE status = 'active' AND next_run_time > ?1
             ORDER BY next_run_time ASC"
        );
        self.query_scheduled(sql, vec![now]).await
    }

    /// Active tasks that should already have fired by `now`.
    ///
    /// A `next_run_time` of 0 marks "nothing pending" and is never missed.
    pub async fn list_missed_scheduled_tasks(&self, now: i64) -> Result<Vec<ScheduledTask>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM scheduled_tasks
             WHERE status = 'active' AND next_run_time > 0 AND next_run_time <= ?1
             ORDER BY next_run_time ASC"
        );
        self.query_scheduled(sql, vec![now]).await
    }

    async fn query_scheduled(&self, sql: String, args: Vec<i64>) -> Result<Vec<ScheduledTask>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(args), row_to_task)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Overwrite the mutable fields of a task and bump `updated_at`.
    ///
    /// Returns the stored row, or `None` if the id does not exist.
    pub async fn save_scheduled_task(&self, task: &ScheduledTask) -> Result<Option<ScheduledTask>> {
        let task = task.clone();
        self.with_conn(move |conn| {
            let sql = format!(
                "UPDATE scheduled_tasks
                 SET description = ?2, type = ?3, schedule = ?4, status = ?5,
                     next_run_time = ?6, last_run_time = ?7, fail_reason = ?8, updated_at = ?9
                 WHERE id = ?1
                 RETURNING {COLUMNS}"
            );
            Ok(conn
                .query_row(
                    &sql,
                    params![
                        task.id,
                        task.description,
                        task.task_type.as_str(),
                        task.schedule,
                        task.status.as_str(),
                        task.next_run_time,
                        task.last_run_time,
                        task.fail_reason,
                        now_millis(),
                    ],
                    row_to_task,
                )
                .optional()?)
        })
        .await
    }

    pub async fn set_scheduled_last_run_time(&self, id: &str, last_run_time: i64) -> Result<()> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE scheduled_tasks SET last_run_time = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, last_run_time, now_millis()],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn set_scheduled_next_run_time(&self, id: &str, next_run_time: i64) -> Result<()> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE scheduled_tasks SET next_run_time = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, next_run_time, now_millis()],
            )?;
            Ok(())
        })
        .await
    }

    /// Set the status, replacing `fail_reason` with the given value.
    pub async fn set_scheduled_status(
        &self,
        id: &str,
        status: ScheduledTaskStatus,
        fail_reason: Option<String>,
    ) -> Result<()> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE scheduled_tasks SET status = ?2, fail_reason = ?3, updated_at = ?4
                 WHERE id = ?1",
                params![id, status.as_str(), fail_reason, now_millis()],
            )?;
            Ok(())
        })
        .await
    }

    /// Delete a task. Returns whether a row was removed.
    pub async fn delete_scheduled_task(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let count = conn.execute("DELETE FROM scheduled_tasks WHERE id = ?1", params![id])?;
            Ok(count > 0)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentd_types::{CreatedBy, ScheduleType};

    fn sample(id: &str, task_type: ScheduleType, next_run_time: i64) -> ScheduledTask {
        ScheduledTask {
            id: id.into(),
            description: format!("task {id}"),
            task_type,
            schedule: "5".into(),
            status: ScheduledTaskStatus::Active,
            next_run_time,
            last_run_time: None,
            created_at: 1_700_000_000_000,
            updated_at: 1_700_000_000_000,
            created_by: CreatedBy::User,
            fail_reason: None,
        }
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let storage = Storage::open_in_memory().unwrap();
        let task = sample("s1", ScheduleType::Interval, 42);
        storage.insert_scheduled_task(&task).await.unwrap();

        let loaded = storage.get_scheduled_task("s1").await.unwrap().unwrap();
        assert_eq!(loaded, task);
        assert!(storage.get_scheduled_task("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_orders_by_next_run_time() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .insert_scheduled_task(&sample("late", ScheduleType::Interval, 300))
            .await
            .unwrap();
        storage
            .insert_scheduled_task(&sample("early", ScheduleType::Interval, 100))
            .await
            .unwrap();
        let mut paused = sample("paused", ScheduleType::Interval, 200);
        paused.status = ScheduledTaskStatus::Paused;
        storage.insert_scheduled_task(&paused).await.unwrap();

        let all: Vec<String> = storage
            .list_scheduled_tasks(false)
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(all, vec!["early", "paused", "late"]);

        let active = storage.list_scheduled_tasks(true).await.unwrap();
        assert_eq!(active.len(), 2);
    }

    #[tokio::test]
    async fn test_missed_and_upcoming_split_on_now() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .insert_scheduled_task(&sample("past", ScheduleType::Once, 500))
            .await
            .unwrap();
        storage
            .insert_scheduled_task(&sample("future", ScheduleType::Interval, 2_000))
            .await
            .unwrap();
        storage
            .insert_scheduled_task(&sample("never", ScheduleType::Once, 0))
            .await
            .unwrap();

        let missed = storage.list_missed_scheduled_tasks(1_000).await.unwrap();
        assert_eq!(missed.len(), 1);
        assert_eq!(missed[0].id, "past");

        let upcoming = storage.list_upcoming_scheduled_tasks(1_000).await.unwrap();
        assert_eq!(upcoming.len(), 1);
        assert_eq!(upcoming[0].id, "future");
    }

    #[tokio::test]
    async fn test_save_and_field_setters() {
        let storage = Storage::open_in_memory().unwrap();
        let mut task = sample("s1", ScheduleType::Interval, 100);
        storage.insert_scheduled_task(&task).await.unwrap();

        task.description = "renamed".into();
        let saved = storage.save_scheduled_task(&task).await.unwrap().unwrap();
        assert_eq!(saved.description, "renamed");
        assert!(saved.updated_at > task.updated_at);

        storage.set_scheduled_last_run_time("s1", 150).await.unwrap();
        storage.set_scheduled_next_run_time("s1", 400).await.unwrap();
        storage
            .set_scheduled_status("s1", ScheduledTaskStatus::Error, Some("bad".into()))
            .await
            .unwrap();
        let loaded = storage.get_scheduled_task("s1").await.unwrap().unwrap();
        assert_eq!(loaded.last_run_time, Some(150));
        assert_eq!(loaded.next_run_time, 400);
        assert_eq!(loaded.status, ScheduledTaskStatus::Error);
        assert_eq!(loaded.fail_reason.as_deref(), Some("bad"));

        let missing = sample("ghost", ScheduleType::Once, 1);
        assert!(storage.save_scheduled_task(&missing).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_reports_removal() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .insert_scheduled_task(&sample("s1", ScheduleType::Interval, 100))
            .await
            .unwrap();
        assert!(storage.delete_scheduled_task("s1").await.unwrap());
        assert!(!storage.delete_scheduled_task("s1").await.unwrap());
    }
}
