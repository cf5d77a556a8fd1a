use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

/// A bridge instance this process has registered, plus its pairing state
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceRecord {
    pub instance_name: String,
    /// Per-instance token handed to the bridge on creation
    pub token: String,
    /// Linked account, set once pairing has completed
    pub jid: Option<String>,
    pub paired_at: Option<String>,
}

impl DeviceRecord {
    pub fn is_paired(&self) -> bool {
        self.jid.is_some()
    }
}

/// Local device-session database
#[derive(Clone)]
pub struct SessionStore {
    conn: Arc<Mutex<Connection>>,
}

impl SessionStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open session database: {}", path.display()))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::run_migrations(&conn)?;

        info!("Session store opened at: {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing)
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS devices (
                instance_name TEXT PRIMARY KEY,
                token TEXT NOT NULL,
                jid TEXT,
                paired_at TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            ",
        )
        .context("Failed to create devices table")?;
        Ok(())
    }

    /// The earliest registered device, if any
    #[cfg(test)]
    pub async fn first_device(&self) -> Result<Option<DeviceRecord>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT instance_name, token, jid, paired_at FROM devices ORDER BY rowid LIMIT 1",
            [],
            parse_device_row,
        )
        .optional()
        .context("Failed to load first device")
    }

    pub async fn device(&self, instance_name: &str) -> Result<Option<DeviceRecord>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT instance_name, token, jid, paired_at FROM devices WHERE instance_name = ?1",
            rusqlite::params![instance_name],
            parse_device_row,
        )
        .optional()
        .with_context(|| format!("Failed to load device '{}'", instance_name))
    }

    /// Load the device for `instance_name`, registering it with a fresh token
    /// on first use.
    pub async fn get_or_create_device(&self, instance_name: &str) -> Result<DeviceRecord> {
        if let Some(device) = self.device(instance_name).await? {
            return Ok(device);
        }

        let token = format!("walog-{}", &Uuid::new_v4().simple().to_string()[..16]);
        let device = DeviceRecord {
            instance_name: instance_name.to_string(),
            token,
            jid: None,
            paired_at: None,
        };
        self.save_device(&device).await?;
        info!("Registered new device '{}'", instance_name);
        Ok(device)
    }

    pub async fn save_device(&self, device: &DeviceRecord) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO devices (instance_name, token, jid, paired_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(instance_name) DO UPDATE SET
                token = excluded.token,
                jid = excluded.jid,
                paired_at = excluded.paired_at",
            rusqlite::params![
                device.instance_name,
                device.token,
                device.jid,
                device.paired_at
            ],
        )
        .context("Failed to save device")?;
        Ok(())
    }

    pub async fn mark_paired(&self, instance_name: &str, jid: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let updated = conn
            .execute(
                "UPDATE devices SET jid = ?2, paired_at = datetime('now') WHERE instance_name = ?1",
                rusqlite::params![instance_name, jid],
            )
            .context("Failed to mark device as paired")?;
        if updated == 0 {
            anyhow::bail!("Unknown device '{}'", instance_name);
        }
        Ok(())
    }

    /// Forget the linked account, e.g. after the phone logged this device out
    pub async fn clear_pairing(&self, instance_name: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE devices SET jid = NULL, paired_at = NULL WHERE instance_name = ?1",
            rusqlite::params![instance_name],
        )
        .context("Failed to clear pairing")?;
        Ok(())
    }
}

fn parse_device_row(row: &rusqlite::Row) -> rusqlite::Result<DeviceRecord> {
    Ok(DeviceRecord {
        instance_name: row.get(0)?,
        token: row.get(1)?,
        jid: row.get(2)?,
        paired_at: row.get(3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_or_create_is_stable() {
        let store = SessionStore::open_in_memory().unwrap();

        let first = store.get_or_create_device("walog").await.unwrap();
        assert!(first.token.starts_with("walog-"));
        assert!(!first.is_paired());

        let again = store.get_or_create_device("walog").await.unwrap();
        assert_eq!(first, again);
    }

    #[tokio::test]
    async fn test_pairing_lifecycle() {
        let store = SessionStore::open_in_memory().unwrap();
        store.get_or_create_device("walog").await.unwrap();

        store
            .mark_paired("walog", "4900000000@s.whatsapp.net")
            .await
            .unwrap();
        let device = store.first_device().await.unwrap().unwrap();
        assert_eq!(device.jid.as_deref(), Some("4900000000@s.whatsapp.net"));
        assert!(device.paired_at.is_some());

        store.clear_pairing("walog").await.unwrap();
        let device = store.device("walog").await.unwrap().unwrap();
        assert!(!device.is_paired());
        assert!(device.paired_at.is_none());
    }

    #[tokio::test]
    async fn test_mark_paired_unknown_device_fails() {
        let store = SessionStore::open_in_memory().unwrap();
        assert!(store.mark_paired("missing", "x@s.whatsapp.net").await.is_err());
        assert!(store.first_device().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_open_on_disk_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.db");

        {
            let store = SessionStore::open(&path).unwrap();
            store.get_or_create_device("walog").await.unwrap();
            store.mark_paired("walog", "49@s.whatsapp.net").await.unwrap();
        }

        let reopened = SessionStore::open(&path).unwrap();
        let device = reopened.device("walog").await.unwrap().unwrap();
        assert!(device.is_paired());
    }
}
