use chrono::Utc;
use relay_core::action::{HttpMethod, NewAction, PendingAction};
use rusqlite::{params, Connection};
use std::path::Path;
use thiserror::Error;

pub const QUEUE_SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("corrupt queue record {id}: {reason}")]
    CorruptRecord { id: i64, reason: String },
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

/// On-device store of pending write operations. Records are owned by the
/// queue until deleted; the replay agent drains them in id (enqueue) order.
pub struct ActionQueue {
    conn: Connection,
}

impl ActionQueue {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        let conn = Connection::open(path)?;
        let queue = Self { conn };
        queue.migrate()?;
        Ok(queue)
    }

    pub fn open_in_memory() -> Result<Self, QueueError> {
        let conn = Connection::open_in_memory()?;
        let queue = Self { conn };
        queue.migrate()?;
        Ok(queue)
    }

    pub fn schema_version(&self) -> Result<i64, QueueError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), QueueError> {
        let current = self.schema_version()?;
        if current > QUEUE_SCHEMA_VERSION {
            return Err(QueueError::UnsupportedSchemaVersion {
                found: current,
                supported: QUEUE_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_action_queue.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    /// Appends one record and returns its local id.
    pub fn enqueue(&self, action: &NewAction) -> Result<i64, QueueError> {
        let payload_json = serde_json::to_string(&action.payload)
            .map_err(|err| QueueError::Serialization(err.to_string()))?;
        self.conn.execute(
            "
            INSERT INTO pending_actions (url, method, payload_json, token, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ",
            params![
                action.url,
                action.method.as_str(),
                payload_json,
                action.token,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// All pending records in enqueue order.
    pub fn pending(&self) -> Result<Vec<PendingAction>, QueueError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT id, url, method, payload_json, token
            FROM pending_actions
            ORDER BY id ASC
            ",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut actions = Vec::new();
        for row in rows {
            let (id, url, method, payload_json, token) = row?;
            let method: HttpMethod = method
                .parse()
                .map_err(|reason| QueueError::CorruptRecord { id, reason })?;
            let payload = serde_json::from_str(&payload_json)
                .map_err(|err| QueueError::CorruptRecord {
                    id,
                    reason: err.to_string(),
                })?;
            actions.push(PendingAction {
                id,
                url,
                method,
                payload,
                token,
            });
        }
        Ok(actions)
    }

    /// Removes a record after it was applied or permanently rejected.
    /// Returns false when the record was already gone.
    pub fn delete(&self, id: i64) -> Result<bool, QueueError> {
        let changes = self
            .conn
            .execute("DELETE FROM pending_actions WHERE id = ?1", params![id])?;
        Ok(changes > 0)
    }

    pub fn len(&self) -> Result<u64, QueueError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM pending_actions", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    pub fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn action(url: &str) -> NewAction {
        NewAction::new(
            HttpMethod::Put,
            url,
            json!({"status": "en_route", "userId": 9}),
            "token-abc",
        )
    }

    #[test]
    fn pending_returns_records_in_enqueue_order() {
        let queue = ActionQueue::open_in_memory().expect("open queue");
        let first = queue.enqueue(&action("/api/orders/1/status")).expect("enqueue");
        let second = queue.enqueue(&action("/api/orders/2/status")).expect("enqueue");
        let third = queue.enqueue(&action("/api/orders/3/status")).expect("enqueue");

        let pending = queue.pending().expect("pending");
        assert_eq!(
            pending.iter().map(|a| a.id).collect::<Vec<_>>(),
            vec![first, second, third]
        );
        assert_eq!(pending[0].url, "/api/orders/1/status");
        assert_eq!(pending[0].method, HttpMethod::Put);
        assert_eq!(pending[0].token, "token-abc");
        assert_eq!(pending[0].payload["userId"], 9);
    }

    #[test]
    fn delete_removes_one_record_and_reports_missing_ones() {
        let queue = ActionQueue::open_in_memory().expect("open queue");
        let first = queue.enqueue(&action("/a")).expect("enqueue");
        let second = queue.enqueue(&action("/b")).expect("enqueue");

        assert!(queue.delete(first).expect("delete"));
        assert!(!queue.delete(first).expect("delete again"));
        assert_eq!(queue.len().expect("len"), 1);
        assert_eq!(queue.pending().expect("pending")[0].id, second);
    }

    #[test]
    fn queue_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("relay-queue.db");

        {
            let queue = ActionQueue::open(&path).expect("open queue");
            queue.enqueue(&action("/api/orders/5/status")).expect("enqueue");
        }

        let queue = ActionQueue::open(&path).expect("reopen queue");
        let pending = queue.pending().expect("pending");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].url, "/api/orders/5/status");
        assert_eq!(queue.schema_version().expect("version"), QUEUE_SCHEMA_VERSION);
    }

    #[test]
    fn empty_queue_reports_empty() {
        let queue = ActionQueue::open_in_memory().expect("open queue");
        assert!(queue.is_empty().expect("is_empty"));
        assert_eq!(queue.pending().expect("pending").len(), 0);
    }
}
