//! The Local Index: an embedded relational store holding the Camera, Event,
//! Clip, Snapshot, and schema-version tables. Concurrency is single-writer,
//! many-reader: [`Database`] hands out a single [`rusqlite::Connection`] for
//! writes and any number of read-only connections.

pub mod camera;
pub mod clip;
pub mod event;
pub mod pool;
pub mod snapshot;
pub mod testutil;
mod timestamp;
mod upgrade;

use base::{err, Error, ErrorKind, ResultExt};
use rusqlite::params;
use std::path::Path;
use tracing::info;

/// Current schema version. Bump and add an `upgrade::vN_to_vM` module when
/// the schema changes; never mutate a past migration in place.
pub const EXPECTED_VERSION: i32 = 1;

static INTEGRITY_PRAGMAS: [&str; 3] = [
    "pragma foreign_keys = on",
    "pragma fullfsync = on",
    "pragma synchronous = 2",
];

fn set_integrity_pragmas(conn: &rusqlite::Connection) -> Result<(), Error> {
    for pragma in INTEGRITY_PRAGMAS {
        conn.execute(pragma, params![])
            .err_kind(ErrorKind::StorageInitFailed)?;
    }
    Ok(())
}

/// Returns `Ok(None)` for a brand new (empty) database file.
fn get_schema_version(conn: &rusqlite::Connection) -> Result<Option<i32>, Error> {
    let have_version_table: i32 = conn
        .query_row(
            "select count(*) from sqlite_master where name = 'version'",
            params![],
            |row| row.get(0),
        )
        .err_kind(ErrorKind::StorageInitFailed)?;
    if have_version_table == 0 {
        return Ok(None);
    }
    Ok(Some(
        conn.query_row("select max(id) from version", params![], |row| row.get(0))
            .err_kind(ErrorKind::StorageInitFailed)?,
    ))
}

/// Opens (creating and migrating if necessary) the index database at `path`.
///
/// `path` should live under the Storage Root so the file and the index stay
/// on the same filesystem (atomic rename guarantees for the clip tree assume
/// this).
pub fn open(path: &Path) -> Result<Database, Error> {
    let mut conn = rusqlite::Connection::open(path).err_kind(ErrorKind::StorageInitFailed)?;
    set_integrity_pragmas(&conn)?;

    let version = get_schema_version(&conn)?;
    match version {
        None => {
            info!(?path, "initializing new index database");
            upgrade::init(&mut conn)?;
        }
        Some(v) if v == EXPECTED_VERSION => {}
        Some(v) if v < EXPECTED_VERSION => {
            info!(from = v, to = EXPECTED_VERSION, "migrating index database");
            upgrade::run(&mut conn, v, EXPECTED_VERSION)?;
        }
        Some(v) => {
            return Err(err!(
                StorageInitFailed,
                "index database is at schema version {v}, newer than supported {EXPECTED_VERSION}"
            ))
        }
    }

    conn.execute("pragma journal_mode = wal", params![])
        .err_kind(ErrorKind::StorageInitFailed)?;

    Ok(Database { conn })
}

/// The single-writer handle onto the index. Cloneable read-only connections
/// are obtained through [`Database::read_pool`]; this type itself is the one
/// and only writer and is never shared across threads without its own lock
/// (callers serialize access the same way the Orchestrator serializes
/// service startup: one owner, passed by `&mut`).
pub struct Database {
    pub(crate) conn: rusqlite::Connection,
}

impl Database {
    /// Returns the path-qualified read-only connection pool backed by the
    /// same file this writer has open.
    pub fn read_pool(&self, path: &Path) -> Result<pool::ReadPool, Error> {
        pool::ReadPool::open(path)
    }

    pub fn conn(&self) -> &rusqlite::Connection {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut rusqlite::Connection {
        &mut self.conn
    }

    pub fn camera(&self) -> camera::Store<'_> {
        camera::Store::new(&self.conn)
    }

    pub fn event(&mut self) -> event::Store<'_> {
        event::Store::new(&mut self.conn)
    }

    pub fn clip(&mut self) -> clip::Store<'_> {
        clip::Store::new(&mut self.conn)
    }

    pub fn snapshot(&mut self) -> snapshot::Store<'_> {
        snapshot::Store::new(&mut self.conn)
    }
}
