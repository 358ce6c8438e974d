//! Shared, reference-counted access to the single physical store.
//!
//! Every subsystem (UI repositories, background sync, maintenance jobs) asks
//! the [`ConnectionManager`] for its own [`DbHandle`]. The physical connection
//! is opened, and the schema brought up to date, by the first `open()`. It is
//! closed when the last handle is dropped, and the next `open()` opens it
//! again lazily.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rusqlite::Connection;
use tracing::{debug, info};

use super::error::DbError;
use super::migration;

type Result<T> = std::result::Result<T, DbError>;

#[derive(Debug, Clone)]
enum Location {
    File(PathBuf),
    Memory,
}

#[derive(Default)]
struct Slot {
    conn: Option<Arc<Mutex<Connection>>>,
    holders: usize,
}

/// Owner of the physical connection, shared by the composition root.
pub struct ConnectionManager {
    location: Location,
    slot: Mutex<Slot>,
}

impl ConnectionManager {
    /// Manager for a store file, created on first open if missing.
    pub fn new<P: AsRef<Path>>(path: P) -> Arc<Self> {
        Arc::new(Self {
            location: Location::File(path.as_ref().to_path_buf()),
            slot: Mutex::new(Slot::default()),
        })
    }

    /// Manager for an in-memory store (for testing).
    ///
    /// Contents are lost whenever the last handle is released.
    pub fn in_memory() -> Arc<Self> {
        Arc::new(Self {
            location: Location::Memory,
            slot: Mutex::new(Slot::default()),
        })
    }

    /// Acquire a handle, opening and migrating the store if no one holds it.
    ///
    /// Migration happens while the open lock is held, so no other caller can
    /// see a partially upgraded store.
    pub fn open(self: &Arc<Self>) -> Result<DbHandle> {
        let mut slot = self.slot.lock().map_err(|_| DbError::LockPoisoned)?;

        let conn = match &slot.conn {
            Some(conn) => Arc::clone(conn),
            None => {
                let conn = Arc::new(Mutex::new(self.connect()?));
                slot.conn = Some(Arc::clone(&conn));
                slot.holders = 0;
                conn
            }
        };
        slot.holders += 1;
        debug!(holders = slot.holders, "store handle acquired");

        Ok(DbHandle {
            manager: Arc::clone(self),
            conn,
        })
    }

    /// Number of live handles.
    pub fn holders(&self) -> usize {
        self.lock_slot().holders
    }

    /// Whether a physical connection is currently open.
    pub fn is_open(&self) -> bool {
        self.lock_slot().conn.is_some()
    }

    fn connect(&self) -> Result<Connection> {
        let mut conn = match &self.location {
            Location::File(path) => {
                info!(path = %path.display(), "opening store");
                Connection::open(path).map_err(|source| DbError::Open {
                    path: path.clone(),
                    source,
                })?
            }
            Location::Memory => Connection::open_in_memory().map_err(|source| DbError::Open {
                path: PathBuf::from(":memory:"),
                source,
            })?,
        };
        migration::initialize(&mut conn)?;
        Ok(conn)
    }

    fn acquire(&self) {
        let mut slot = self.lock_slot();
        slot.holders += 1;
    }

    fn release(&self) {
        let mut slot = self.lock_slot();
        slot.holders = slot.holders.saturating_sub(1);
        if slot.holders == 0 && slot.conn.take().is_some() {
            info!("last store handle released, closing connection");
        }
    }

    // Counter updates must still happen after a panic elsewhere, so poisoning is ignored here.
    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One logical holder's access to the store.
///
/// Dropping the handle (or calling [`DbHandle::close`]) releases it.
pub struct DbHandle {
    manager: Arc<ConnectionManager>,
    conn: Arc<Mutex<Connection>>,
}

impl DbHandle {
    /// Lock the connection for a run of statements.
    pub fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| DbError::LockPoisoned)
    }

    /// Release this handle.
    pub fn close(self) {}
}

impl Clone for DbHandle {
    fn clone(&self) -> Self {
        self.manager.acquire();
        Self {
            manager: Arc::clone(&self.manager),
            conn: Arc::clone(&self.conn),
        }
    }
}

impl Drop for DbHandle {
    fn drop(&mut self) {
        self.manager.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_close_closes_connection() {
        let manager = ConnectionManager::in_memory();
        let first = manager.open().unwrap();
        let second = manager.open().unwrap();
        assert_eq!(manager.holders(), 2);

        first.close();
        assert!(manager.is_open());
        assert_eq!(manager.holders(), 1);

        second.close();
        assert!(!manager.is_open());
        assert_eq!(manager.holders(), 0);
    }

    #[test]
    fn reopen_after_full_close() {
        let manager = ConnectionManager::in_memory();
        manager.open().unwrap().close();
        assert!(!manager.is_open());

        let handle = manager.open().unwrap();
        let version = migration::schema_version(&handle.conn().unwrap()).unwrap();
        assert_eq!(version, super::super::schema::SCHEMA_VERSION);
    }

    #[test]
    fn cloned_handle_counts_as_holder() {
        let manager = ConnectionManager::in_memory();
        let handle = manager.open().unwrap();
        let clone = handle.clone();
        assert_eq!(manager.holders(), 2);
        drop(handle);
        assert!(manager.is_open());
        drop(clone);
        assert!(!manager.is_open());
    }

    #[test]
    fn handles_share_one_connection() {
        let manager = ConnectionManager::in_memory();
        let writer = manager.open().unwrap();
        let reader = manager.open().unwrap();

        writer
            .conn()
            .unwrap()
            .execute("INSERT INTO users (name) VALUES ('ana')", [])
            .unwrap();
        let count: i64 = reader
            .conn()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn concurrent_open_and_drop_balance_out() {
        let manager = ConnectionManager::in_memory();

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..50 {
                        let handle = manager.open().unwrap();
                        let clone = handle.clone();
                        drop(handle);
                        let version = migration::schema_version(&clone.conn().unwrap()).unwrap();
                        assert_eq!(version, super::super::schema::SCHEMA_VERSION);
                    }
                });
            }
        });

        assert_eq!(manager.holders(), 0);
        assert!(!manager.is_open());
    }
}
