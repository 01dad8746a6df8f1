use crate::error::CrackError;
use crate::store::TaskStoreLike;
use crate::task::{Task, TaskStatus};
use postgres::{Client, NoTls, Row};
use tracing::{debug, error};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS tasks (
        request_id TEXT PRIMARY KEY,
        hash TEXT NOT NULL,
        max_length INTEGER NOT NULL,
        status TEXT NOT NULL,
        data TEXT
    );
    CREATE UNIQUE INDEX IF NOT EXISTS tasks_hash_request_id ON tasks (hash, request_id);
    CREATE INDEX IF NOT EXISTS tasks_status ON tasks (status);
";

/// Task store backed by a single PostgreSQL table. Every write is one
/// statement, so it either applies fully or leaves the prior row in place.
pub struct PostgresTaskStore {
    client: Client,
}

impl PostgresTaskStore {
    pub fn connect(database_url: &str) -> Result<Self, CrackError> {
        let mut client = Client::connect(database_url, NoTls)?;
        client.batch_execute(SCHEMA)?;
        Ok(Self { client })
    }

    fn row_to_task(row: &Row) -> Result<Task, CrackError> {
        let status: String = row.try_get("status")?;
        let max_length: i32 = row.try_get("max_length")?;
        Ok(Task {
            request_id: row.try_get("request_id")?,
            hash: row.try_get("hash")?,
            max_length: max_length as u32,
            status: status.parse()?,
            data: row.try_get("data")?,
        })
    }
}

impl TaskStoreLike for PostgresTaskStore {
    fn find_active_by_hash(&mut self, hash: &str) -> Result<Option<Task>, CrackError> {
        let row = self
            .client
            .query_opt(
                "SELECT request_id, hash, max_length, status, data FROM tasks \
                 WHERE hash = $1 AND status <> 'ERROR' LIMIT 1",
                &[&hash],
            )
            .inspect_err(|e| error!(hash, error = %e, "failed to look up task by hash"))?;
        row.as_ref().map(Self::row_to_task).transpose()
    }

    fn find_by_request_id(&mut self, request_id: &str) -> Result<Option<Task>, CrackError> {
        let row = self
            .client
            .query_opt(
                "SELECT request_id, hash, max_length, status, data FROM tasks WHERE request_id = $1",
                &[&request_id],
            )
            .inspect_err(|e| error!(request_id, error = %e, "failed to look up task"))?;
        row.as_ref().map(Self::row_to_task).transpose()
    }

    fn find_waiting(&mut self) -> Result<Vec<Task>, CrackError> {
        let rows = self.client.query(
            "SELECT request_id, hash, max_length, status, data FROM tasks \
             WHERE status = 'WAITING' ORDER BY request_id",
            &[],
        )?;
        rows.iter().map(Self::row_to_task).collect()
    }

    fn insert(&mut self, task: &Task) -> Result<(), CrackError> {
        let max_length = task.max_length as i32;
        self.client
            .execute(
                "INSERT INTO tasks (request_id, hash, max_length, status, data) VALUES ($1, $2, $3, $4, $5)",
                &[&task.request_id, &task.hash, &max_length, &task.status.as_str(), &task.data],
            )
            .inspect_err(|e| error!(request_id = %task.request_id, error = %e, "failed to insert task"))?;
        debug!(request_id = %task.request_id, status = %task.status, "task inserted");
        Ok(())
    }

    fn transition(
        &mut self,
        request_id: &str,
        expected: &[TaskStatus],
        status: TaskStatus,
        data: Option<&str>,
    ) -> Result<bool, CrackError> {
        let expected: Vec<&str> = expected.iter().map(TaskStatus::as_str).collect();
        let updated = self
            .client
            .execute(
                "UPDATE tasks SET status = $1, data = COALESCE($2, data) \
                 WHERE request_id = $3 AND status = ANY($4)",
                &[&status.as_str(), &data, &request_id, &expected],
            )
            .inspect_err(|e| error!(request_id, error = %e, "failed to update task"))?;
        debug!(request_id, status = %status, updated, "task transition");
        Ok(updated == 1)
    }
}
