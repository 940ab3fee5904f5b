//! Main store implementation.

use std::path::Path;
use std::str::FromStr;

use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row};
use time::OffsetDateTime;
use tracing::{debug, info};

use airtrack_types::{ConnectionState, DeliveryState};

use crate::error::{Error, Result};
use crate::models::{DeviceRecord, QueueStats, QueuedMessage, TelemetryMessage};
use crate::schema;

const APP_ID_KEY: &str = "app_id";

const DEVICE_COLUMNS: &str =
    "address, family, label, desired_state, actual_state, version, added_at, updated_at";

const MESSAGE_COLUMNS: &str = "id, kind, payload, topic_pattern, username, app_version, \
     session_id, enqueued_at, state, attempts";

/// SQLite-based store for device records and the telemetry queue.
///
/// The store is synchronous; async callers share it behind a
/// `tokio::sync::Mutex` so enqueue and acknowledge never interleave.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open or create a database at the given path.
    ///
    /// Messages that were in flight when the previous process stopped are
    /// returned to pending, and every device's actual state is reset to
    /// disconnected.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| Error::CreateDirectory {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        info!("Opening database at {}", path.display());
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = FULL;",
        )?;

        Self::from_connection(conn)
    }

    /// Open the default database location.
    pub fn open_default() -> Result<Self> {
        Self::open(crate::default_db_path())
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        schema::initialize(&conn)?;
        let store = Self { conn };

        let requeued = store.requeue_in_flight()?;
        if requeued > 0 {
            info!("Returned {} in-flight message(s) to the queue", requeued);
        }
        store.reset_actual_states()?;

        Ok(store)
    }

    // === Device operations ===

    /// Insert a device or update its family, label and version.
    ///
    /// Desired and actual state of an existing record are left untouched.
    pub fn upsert_device(&self, record: &DeviceRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO devices (address, family, label, desired_state, actual_state, version, added_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(address) DO UPDATE SET
                family = ?2,
                label = ?3,
                version = COALESCE(?6, version),
                updated_at = ?8",
            rusqlite::params![
                record.address,
                record.family.as_str(),
                record.label,
                record.desired_state.as_str(),
                record.actual_state.as_str(),
                record.version,
                record.added_at.unix_timestamp(),
                record.updated_at.unix_timestamp(),
            ],
        )?;
        debug!("Upserted device {}", record.address);
        Ok(())
    }

    /// Get a device by address.
    pub fn get_device(&self, address: &str) -> Result<Option<DeviceRecord>> {
        let device = self
            .conn
            .query_row(
                &format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE address = ?"),
                [address],
                device_from_row,
            )
            .optional()?;
        Ok(device)
    }

    /// List all devices, oldest first.
    pub fn list_devices(&self) -> Result<Vec<DeviceRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {DEVICE_COLUMNS} FROM devices ORDER BY added_at, address"
        ))?;
        let devices = stmt
            .query_map([], device_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(devices)
    }

    /// Record the connection state the user asked for.
    pub fn set_desired_state(&self, address: &str, state: ConnectionState) -> Result<()> {
        self.update_state_column(address, "desired_state", state)
    }

    /// Record the connection state the transport reported.
    pub fn set_actual_state(&self, address: &str, state: ConnectionState) -> Result<()> {
        self.update_state_column(address, "actual_state", state)
    }

    fn update_state_column(
        &self,
        address: &str,
        column: &str,
        state: ConnectionState,
    ) -> Result<()> {
        let changed = self.conn.execute(
            &format!("UPDATE devices SET {column} = ?2, updated_at = ?3 WHERE address = ?1"),
            rusqlite::params![
                address,
                state.as_str(),
                OffsetDateTime::now_utc().unix_timestamp()
            ],
        )?;
        if changed == 0 {
            return Err(Error::DeviceNotFound(address.to_string()));
        }
        Ok(())
    }

    /// Delete a device. Returns whether a record existed.
    pub fn delete_device(&self, address: &str) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM devices WHERE address = ?", [address])?;
        Ok(deleted > 0)
    }

    /// Mark every device as disconnected; nothing is connected after a restart.
    fn reset_actual_states(&self) -> Result<usize> {
        let changed = self.conn.execute(
            "UPDATE devices SET actual_state = ?1 WHERE actual_state != ?1",
            [ConnectionState::Disconnected.as_str()],
        )?;
        Ok(changed)
    }

    // === Telemetry queue ===

    /// Persist a message at the tail of the queue and return its id.
    ///
    /// The message is durable once this returns.
    pub fn enqueue(&self, message: &TelemetryMessage) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO telemetry_queue
                (kind, payload, topic_pattern, username, app_version, session_id, enqueued_at, state)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                message.kind.as_str(),
                message.payload,
                message.topic_pattern,
                message.username,
                message.app_version,
                message.session_id,
                message.enqueued_at.unix_timestamp(),
                DeliveryState::Pending.as_str(),
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        debug!("Enqueued {} message {}", message.kind.as_str(), id);
        Ok(id)
    }

    /// The oldest undelivered message, if any.
    ///
    /// In-flight messages are returned too, so a message whose confirmation
    /// never arrived is retried before anything newer.
    pub fn next_pending(&self) -> Result<Option<QueuedMessage>> {
        let message = self
            .conn
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM telemetry_queue ORDER BY id LIMIT 1"),
                [],
                message_from_row,
            )
            .optional()?;
        Ok(message)
    }

    /// Undelivered messages in delivery order.
    pub fn pending_messages(&self, limit: usize) -> Result<Vec<QueuedMessage>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM telemetry_queue ORDER BY id LIMIT ?"
        ))?;
        let messages = stmt
            .query_map([limit as i64], message_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    /// Mark a message as handed to the broker and count the attempt.
    pub fn mark_in_flight(&self, id: i64) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE telemetry_queue SET state = ?2, attempts = attempts + 1 WHERE id = ?1",
            rusqlite::params![id, DeliveryState::InFlight.as_str()],
        )?;
        if changed == 0 {
            return Err(Error::MessageNotFound(id));
        }
        Ok(())
    }

    /// Return a message to pending after a failed publish.
    pub fn mark_pending(&self, id: i64) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE telemetry_queue SET state = ?2 WHERE id = ?1",
            rusqlite::params![id, DeliveryState::Pending.as_str()],
        )?;
        if changed == 0 {
            return Err(Error::MessageNotFound(id));
        }
        Ok(())
    }

    /// Purge a message the broker confirmed. Returns whether it was still queued.
    pub fn acknowledge(&self, id: i64) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM telemetry_queue WHERE id = ?", [id])?;
        Ok(deleted > 0)
    }

    /// Return every in-flight message to pending.
    pub fn requeue_in_flight(&self) -> Result<usize> {
        let changed = self.conn.execute(
            "UPDATE telemetry_queue SET state = ?1 WHERE state = ?2",
            [
                DeliveryState::Pending.as_str(),
                DeliveryState::InFlight.as_str(),
            ],
        )?;
        Ok(changed)
    }

    /// Assign every ownerless message to `username`. Returns how many were claimed.
    pub fn claim_unowned(&self, username: &str) -> Result<usize> {
        let changed = self.conn.execute(
            "UPDATE telemetry_queue SET username = ?1 WHERE username IS NULL",
            [username],
        )?;
        if changed > 0 {
            info!("Assigned {} deferred message(s) to {}", changed, username);
        }
        Ok(changed)
    }

    /// Number of undelivered messages.
    pub fn queue_len(&self) -> Result<usize> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM telemetry_queue", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Queue occupancy by state.
    pub fn queue_stats(&self) -> Result<QueueStats> {
        let stats = self.conn.query_row(
            "SELECT
                COALESCE(SUM(state = ?1), 0),
                COALESCE(SUM(state = ?2), 0),
                COALESCE(SUM(username IS NULL), 0)
             FROM telemetry_queue",
            [
                DeliveryState::Pending.as_str(),
                DeliveryState::InFlight.as_str(),
            ],
            |row| {
                Ok(QueueStats {
                    pending: row.get::<_, i64>(0)? as usize,
                    in_flight: row.get::<_, i64>(1)? as usize,
                    unowned: row.get::<_, i64>(2)? as usize,
                })
            },
        )?;
        Ok(stats)
    }

    // === Metadata ===

    /// Persistent application id, minted on first use.
    pub fn app_id(&self) -> Result<String> {
        if let Some(id) = self.get_metadata(APP_ID_KEY)? {
            return Ok(id);
        }
        let id = uuid::Uuid::new_v4().to_string();
        self.set_metadata(APP_ID_KEY, &id)?;
        info!("Generated application id {}", id);
        Ok(id)
    }

    /// Read a metadata value.
    pub fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row("SELECT value FROM metadata WHERE key = ?", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    /// Write a metadata value.
    pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO metadata (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = ?2",
            [key, value],
        )?;
        Ok(())
    }
}

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let text: String = row.get(idx)?;
    text.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<OffsetDateTime> {
    let secs: i64 = row.get(idx)?;
    OffsetDateTime::from_unix_timestamp(secs)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Integer, Box::new(e)))
}

fn device_from_row(row: &Row<'_>) -> rusqlite::Result<DeviceRecord> {
    Ok(DeviceRecord {
        address: row.get(0)?,
        family: parse_column(row, 1)?,
        label: row.get(2)?,
        desired_state: parse_column(row, 3)?,
        actual_state: parse_column(row, 4)?,
        version: row.get(5)?,
        added_at: timestamp_column(row, 6)?,
        updated_at: timestamp_column(row, 7)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<QueuedMessage> {
    Ok(QueuedMessage {
        id: row.get(0)?,
        message: TelemetryMessage {
            kind: parse_column(row, 1)?,
            payload: row.get(2)?,
            topic_pattern: row.get(3)?,
            username: row.get(4)?,
            app_version: row.get(5)?,
            session_id: row.get(6)?,
            enqueued_at: timestamp_column(row, 7)?,
        },
        state: parse_column(row, 8)?,
        attempts: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use airtrack_types::{DeviceFamily, TelemetryKind};

    fn message(payload: &str) -> TelemetryMessage {
        TelemetryMessage::new(
            TelemetryKind::Reading,
            payload,
            "sensors/{username}/airtrack-v1",
            "0.1.0",
        )
        .with_username(Some("alice".to_string()))
    }

    #[test]
    fn test_open_in_memory() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.list_devices().unwrap().is_empty());
        assert_eq!(store.queue_len().unwrap(), 0);
    }

    #[test]
    fn test_upsert_device() {
        let store = Store::open_in_memory().unwrap();
        let record = DeviceRecord::new("00:18:96:10:57:A2", DeviceFamily::AirBeam3);
        store.upsert_device(&record).unwrap();

        let stored = store.get_device("00:18:96:10:57:A2").unwrap().unwrap();
        assert_eq!(stored.family, DeviceFamily::AirBeam3);
        assert_eq!(stored.label, "AirBeam3 57A2");
        assert_eq!(stored.desired_state, ConnectionState::Disconnected);

        store
            .set_desired_state("00:18:96:10:57:A2", ConnectionState::Connected)
            .unwrap();
        store
            .upsert_device(&record.clone().with_label("Backpack"))
            .unwrap();

        let stored = store.get_device("00:18:96:10:57:A2").unwrap().unwrap();
        assert_eq!(stored.label, "Backpack");
        assert_eq!(stored.desired_state, ConnectionState::Connected);
        assert!(stored.is_auto_connecting());
    }

    #[test]
    fn test_state_update_for_unknown_device() {
        let store = Store::open_in_memory().unwrap();
        let err = store
            .set_actual_state("missing", ConnectionState::Connected)
            .unwrap_err();
        assert!(matches!(err, Error::DeviceNotFound(_)));
    }

    #[test]
    fn test_delete_device() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_device(&DeviceRecord::new("AA", DeviceFamily::RuuviTag))
            .unwrap();
        assert!(store.delete_device("AA").unwrap());
        assert!(!store.delete_device("AA").unwrap());
        assert!(store.get_device("AA").unwrap().is_none());
    }

    #[test]
    fn test_queue_is_fifo() {
        let store = Store::open_in_memory().unwrap();
        let first = store.enqueue(&message("1")).unwrap();
        let second = store.enqueue(&message("2")).unwrap();
        assert!(second > first);

        let next = store.next_pending().unwrap().unwrap();
        assert_eq!(next.id, first);
        assert_eq!(next.message.payload, "1");
        assert_eq!(next.state, DeliveryState::Pending);

        assert!(store.acknowledge(first).unwrap());
        assert!(!store.acknowledge(first).unwrap());

        let next = store.next_pending().unwrap().unwrap();
        assert_eq!(next.id, second);
    }

    #[test]
    fn test_in_flight_stays_at_head() {
        let store = Store::open_in_memory().unwrap();
        let first = store.enqueue(&message("1")).unwrap();
        store.enqueue(&message("2")).unwrap();

        store.mark_in_flight(first).unwrap();
        let head = store.next_pending().unwrap().unwrap();
        assert_eq!(head.id, first);
        assert_eq!(head.state, DeliveryState::InFlight);
        assert_eq!(head.attempts, 1);

        store.mark_pending(first).unwrap();
        store.mark_in_flight(first).unwrap();
        assert_eq!(store.next_pending().unwrap().unwrap().attempts, 2);

        assert_eq!(store.requeue_in_flight().unwrap(), 1);
        let stats = store.queue_stats().unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.in_flight, 0);
    }

    #[test]
    fn test_missing_message_updates_fail() {
        let store = Store::open_in_memory().unwrap();
        assert!(matches!(
            store.mark_in_flight(42),
            Err(Error::MessageNotFound(42))
        ));
        assert!(matches!(
            store.mark_pending(42),
            Err(Error::MessageNotFound(42))
        ));
    }

    #[test]
    fn test_claim_unowned() {
        let store = Store::open_in_memory().unwrap();
        store
            .enqueue(&message("1").with_username(None))
            .unwrap();
        store.enqueue(&message("2")).unwrap();
        assert_eq!(store.queue_stats().unwrap().unowned, 1);

        assert_eq!(store.claim_unowned("bob").unwrap(), 1);
        let messages = store.pending_messages(10).unwrap();
        assert_eq!(messages[0].message.username.as_deref(), Some("bob"));
        assert_eq!(messages[1].message.username.as_deref(), Some("alice"));
        assert_eq!(store.queue_stats().unwrap().unowned, 0);
    }

    #[test]
    fn test_pending_messages_limit() {
        let store = Store::open_in_memory().unwrap();
        for i in 0..5 {
            store.enqueue(&message(&i.to_string())).unwrap();
        }
        let messages = store.pending_messages(3).unwrap();
        let payloads: Vec<_> = messages.iter().map(|m| m.message.payload.as_str()).collect();
        assert_eq!(payloads, vec!["0", "1", "2"]);
    }

    #[test]
    fn test_app_id_is_stable() {
        let store = Store::open_in_memory().unwrap();
        let id = store.app_id().unwrap();
        assert_eq!(store.app_id().unwrap(), id);
        assert!(uuid::Uuid::parse_str(&id).is_ok());
    }

    #[test]
    fn test_reopen_recovers_in_flight_and_resets_devices() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("airtrack.db");

        let (first, app_id) = {
            let store = Store::open(&path).unwrap();
            let mut record = DeviceRecord::new("AA:BB", DeviceFamily::AirBeam2);
            record.desired_state = ConnectionState::Connected;
            store.upsert_device(&record).unwrap();
            store
                .set_actual_state("AA:BB", ConnectionState::Connected)
                .unwrap();

            let first = store.enqueue(&message("1")).unwrap();
            store.enqueue(&message("2")).unwrap();
            store.mark_in_flight(first).unwrap();
            (first, store.app_id().unwrap())
        };

        let store = Store::open(&path).unwrap();
        let head = store.next_pending().unwrap().unwrap();
        assert_eq!(head.id, first);
        assert_eq!(head.state, DeliveryState::Pending);
        assert_eq!(store.queue_len().unwrap(), 2);
        assert_eq!(store.app_id().unwrap(), app_id);

        let device = store.get_device("AA:BB").unwrap().unwrap();
        assert_eq!(device.desired_state, ConnectionState::Connected);
        assert_eq!(device.actual_state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_shared_store_serializes_enqueue_and_ack() {
        use std::sync::Arc;
        use tokio::sync::Mutex;

        let store = Arc::new(Mutex::new(Store::open_in_memory().unwrap()));

        let producer = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                for i in 0..50 {
                    store.lock().await.enqueue(&message(&i.to_string())).unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut delivered = Vec::new();
        while delivered.len() < 50 {
            let next = store.lock().await.next_pending().unwrap();
            match next {
                Some(queued) => {
                    store.lock().await.acknowledge(queued.id).unwrap();
                    delivered.push(queued.message.payload);
                }
                None => tokio::task::yield_now().await,
            }
        }
        producer.await.unwrap();

        let expected: Vec<String> = (0..50).map(|i| i.to_string()).collect();
        assert_eq!(delivered, expected);
        assert_eq!(store.lock().await.queue_len().unwrap(), 0);
    }
}
