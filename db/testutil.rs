//! Test-only helpers for building a [`crate::Database`] without touching disk.

use crate::{set_integrity_pragmas, upgrade, Database};

/// Opens an in-memory, fully migrated database. Panics on failure since this
/// is only ever called from test code.
pub fn open_in_memory() -> Database {
    let mut conn = rusqlite::Connection::open_in_memory().expect("open in-memory sqlite");
    set_integrity_pragmas(&conn).expect("set integrity pragmas");
    upgrade::init(&mut conn).expect("init schema");
    Database { conn }
}
