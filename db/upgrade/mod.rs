//! Schema migrations, run in order inside one transaction each.

mod v0_to_v1;

use base::{err, Error, ErrorKind, ResultExt};
use rusqlite::params;

const UPGRADE_NOTES: &str = concat!("upgraded using sentryedge-db ", env!("CARGO_PKG_VERSION"));

type Migration = fn(&rusqlite::Transaction) -> Result<(), Error>;

const MIGRATIONS: &[Migration] = &[v0_to_v1::run];

/// Creates the `version` table and runs every migration up to
/// [`crate::EXPECTED_VERSION`] against a brand new (empty) connection.
pub(crate) fn init(conn: &mut rusqlite::Connection) -> Result<(), Error> {
    conn.execute_batch(
        r#"
        create table version (
          id         integer primary key,
          unix_time  integer not null,
          notes      text
        );
        "#,
    )
    .err_kind(ErrorKind::StorageInitFailed)?;
    run(conn, 0, crate::EXPECTED_VERSION)
}

/// Runs every migration strictly between `from_ver` and `to_ver`, each in its
/// own transaction, recording a `version` row on commit.
pub(crate) fn run(conn: &mut rusqlite::Connection, from_ver: i32, to_ver: i32) -> Result<(), Error> {
    assert_eq!(MIGRATIONS.len(), crate::EXPECTED_VERSION as usize);
    if from_ver > to_ver {
        return Err(err!(
            StorageInitFailed,
            "index database is at schema version {from_ver}, newer than requested {to_ver}"
        ));
    }
    for ver in from_ver..to_ver {
        let tx = conn.transaction().err_kind(ErrorKind::StorageInitFailed)?;
        MIGRATIONS[ver as usize](&tx)?;
        tx.execute(
            "insert into version (id, unix_time, notes) values (?, unixepoch(), ?)",
            params![ver + 1, UPGRADE_NOTES],
        )
        .err_kind(ErrorKind::StorageInitFailed)?;
        tx.commit().err_kind(ErrorKind::StorageInitFailed)?;
    }
    Ok(())
}
