use std::time::Duration;

use chrono::Utc;
use rusqlite::OptionalExtension;

use super::Database;
use crate::error::Result;

/// Who holds the scheduler lease and until when (unix milliseconds).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub holder: String,
    pub expires_at: i64,
}

impl Database {
    // ============================================================
    // Scheduler lease
    // ============================================================

    /// Take or renew the scheduler lease for `holder`. Fails (returns the
    /// current lease) while another holder's lease has not expired.
    pub fn acquire_lease(&self, holder: &str, ttl: Duration) -> Result<std::result::Result<(), Lease>> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let now = Utc::now().timestamp_millis();
        let expires_at = now.saturating_add(ttl.as_millis() as i64);

        let rows = conn.execute(
            "INSERT INTO scheduler_lease (id, holder, expires_at) VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET holder = excluded.holder, expires_at = excluded.expires_at
             WHERE scheduler_lease.holder = excluded.holder OR scheduler_lease.expires_at <= ?3",
            (holder, expires_at, now),
        )?;
        if rows > 0 {
            return Ok(Ok(()));
        }

        let current = conn
            .query_row(
                "SELECT holder, expires_at FROM scheduler_lease WHERE id = 1",
                [],
                |row| {
                    Ok(Lease {
                        holder: row.get(0)?,
                        expires_at: row.get(1)?,
                    })
                },
            )
            .optional()?;
        match current {
            Some(lease) => Ok(Err(lease)),
            None => Ok(Ok(())),
        }
    }

    /// Give the lease up if `holder` still has it.
    pub fn release_lease(&self, holder: &str) -> Result<bool> {
        let conn = self.conn.lock().expect("database lock poisoned");
        let rows = conn.execute("DELETE FROM scheduler_lease WHERE holder = ?", [holder])?;
        Ok(rows > 0)
    }
}
