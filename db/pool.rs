//! A small fixed-size pool of read-only connections onto the index database.
//!
//! The index's write path goes exclusively through [`crate::Database`]'s
//! single connection; every other component (Read API handlers, the relay
//! uploader's dequeue scan) borrows a connection from here. `rusqlite`
//! connections aren't `Sync`, so the pool hands out one at a time guarded by
//! a `std::sync::Mutex`-protected free list rather than sharing one
//! connection across tasks.

use base::{Error, ErrorKind, ResultExt};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub struct ReadPool {
    path: PathBuf,
    idle: Mutex<Vec<rusqlite::Connection>>,
}

impl ReadPool {
    pub(crate) fn open(path: &Path) -> Result<Self, Error> {
        // Eagerly open one connection so misconfiguration (missing file,
        // permissions) surfaces at Storage Root startup rather than on the
        // first request.
        let conn = Self::open_one(path)?;
        Ok(ReadPool {
            path: path.to_owned(),
            idle: Mutex::new(vec![conn]),
        })
    }

    fn open_one(path: &Path) -> Result<rusqlite::Connection, Error> {
        let conn = rusqlite::Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .err_kind(ErrorKind::StorageInitFailed)?;
        Ok(conn)
    }

    /// Borrows a connection, creating a new one if the pool is momentarily
    /// exhausted (readers never block on each other; SQLite itself handles
    /// concurrent readers in WAL mode).
    pub fn get(&self) -> Result<PooledConnection<'_>, Error> {
        let conn = self
            .idle
            .lock()
            .unwrap()
            .pop()
            .map(Ok)
            .unwrap_or_else(|| Self::open_one(&self.path))?;
        Ok(PooledConnection { pool: self, conn: Some(conn) })
    }
}

pub struct PooledConnection<'a> {
    pool: &'a ReadPool,
    conn: Option<rusqlite::Connection>,
}

impl std::ops::Deref for PooledConnection<'_> {
    type Target = rusqlite::Connection;
    fn deref(&self) -> &rusqlite::Connection {
        self.conn.as_ref().unwrap()
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.idle.lock().unwrap().push(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_connections() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("index.db");
        let mut db = crate::open(&db_path).unwrap();
        db.conn_mut().execute_batch("").unwrap();
        drop(db);

        let pool = ReadPool::open(&db_path).unwrap();
        {
            let _c1 = pool.get().unwrap();
        }
        let _c2 = pool.get().unwrap();
        assert_eq!(pool.idle.lock().unwrap().len(), 0);
    }
}
