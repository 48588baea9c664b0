//! The Clip table. Clip Recorder inserts rows after a successful seal; the
//! retention sweeper deletes them (file first, then row — §5's invariant
//! "the on-disk sealed file exists iff the row exists" is maintained by
//! always deleting in that order).

use crate::timestamp::{from_row, to_text};
use base::{Error, ErrorKind, ResultExt};
use jiff::Timestamp;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Clip {
    pub id: Uuid,
    pub event_id: Uuid,
    pub path: String,
    pub unsealed_size: i64,
    pub sealed_size: i64,
    pub duration_ms: i64,
    pub started_at: Timestamp,
    pub ended_at: Timestamp,
    pub key_hash: String,
}

fn row_to_clip(row: &rusqlite::Row) -> rusqlite::Result<Clip> {
    Ok(Clip {
        id: parse_uuid(row, "id")?,
        event_id: parse_uuid(row, "event_id")?,
        path: row.get("path")?,
        unsealed_size: row.get("unsealed_size")?,
        sealed_size: row.get("sealed_size")?,
        duration_ms: row.get("duration_ms")?,
        started_at: from_row(row, "started_at")?,
        ended_at: from_row(row, "ended_at")?,
        key_hash: row.get("key_hash")?,
    })
}

fn parse_uuid(row: &rusqlite::Row, col: &str) -> rusqlite::Result<Uuid> {
    let s: String = row.get(col)?;
    s.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(s.len(), rusqlite::types::Type::Text, Box::new(e)))
}

pub struct Store<'a> {
    conn: &'a mut rusqlite::Connection,
}

impl<'a> Store<'a> {
    pub(crate) fn new(conn: &'a mut rusqlite::Connection) -> Self {
        Store { conn }
    }

    pub fn get(&self, id: Uuid) -> Result<Option<Clip>, Error> {
        self.conn
            .query_row("select * from clip where id = ?", params![id.to_string()], row_to_clip)
            .optional()
            .err_kind(ErrorKind::Internal)
    }

    pub fn get_by_event(&self, event_id: Uuid) -> Result<Option<Clip>, Error> {
        self.conn
            .query_row(
                "select * from clip where event_id = ?",
                params![event_id.to_string()],
                row_to_clip,
            )
            .optional()
            .err_kind(ErrorKind::Internal)
    }

    pub fn insert(&self, clip: &Clip) -> Result<(), Error> {
        self.conn
            .execute(
                r#"
                insert into clip (
                  id, event_id, path, unsealed_size, sealed_size, duration_ms,
                  started_at, ended_at, key_hash
                ) values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
                params![
                    clip.id.to_string(),
                    clip.event_id.to_string(),
                    clip.path,
                    clip.unsealed_size,
                    clip.sealed_size,
                    clip.duration_ms,
                    to_text(clip.started_at),
                    to_text(clip.ended_at),
                    clip.key_hash,
                ],
            )
            .err_kind(ErrorKind::Internal)?;
        Ok(())
    }

    /// Clips with `ended_at` older than `cutoff`, oldest first — the
    /// retention sweeper's age rule.
    pub fn list_older_than(&self, cutoff: Timestamp) -> Result<Vec<Clip>, Error> {
        let mut stmt = self
            .conn
            .prepare_cached("select * from clip where ended_at < ? order by ended_at")
            .err_kind(ErrorKind::Internal)?;
        let rows = stmt
            .query_map(params![to_text(cutoff)], row_to_clip)
            .err_kind(ErrorKind::Internal)?;
        rows.collect::<Result<_, _>>().err_kind(ErrorKind::Internal)
    }

    /// All clips oldest first — the retention sweeper's watermark rule walks
    /// this until usage drops back below the configured percentage.
    pub fn list_oldest_first(&self) -> Result<Vec<Clip>, Error> {
        let mut stmt = self
            .conn
            .prepare_cached("select * from clip order by ended_at")
            .err_kind(ErrorKind::Internal)?;
        let rows = stmt.query_map(params![], row_to_clip).err_kind(ErrorKind::Internal)?;
        rows.collect::<Result<_, _>>().err_kind(ErrorKind::Internal)
    }

    /// Deletes the row and clears the owning event's `clip_id`. Callers must
    /// unlink/remove the on-disk file first so the row never outlives it.
    pub fn delete(&self, id: Uuid) -> Result<(), Error> {
        let tx = self.conn.unchecked_transaction().err_kind(ErrorKind::Internal)?;
        tx.execute(
            "update event set clip_id = null where clip_id = ?",
            params![id.to_string()],
        )
        .err_kind(ErrorKind::Internal)?;
        tx.execute("delete from clip where id = ?", params![id.to_string()])
            .err_kind(ErrorKind::Internal)?;
        tx.commit().err_kind(ErrorKind::Internal)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_clip(event_id: Uuid, ended_at: Timestamp) -> Clip {
        Clip {
            id: Uuid::now_v7(),
            event_id,
            path: "clips/2026/07/26/x.sealed".to_string(),
            unsealed_size: 1000,
            sealed_size: 1012,
            duration_ms: 2500,
            started_at: ended_at,
            ended_at,
            key_hash: "deadbeef".to_string(),
        }
    }

    #[test]
    fn delete_clears_owning_event() {
        let mut db = crate::testutil::open_in_memory();
        let t = Timestamp::from_second(1000).unwrap();
        db.camera()
            .register(&crate::camera::Observation {
                id: "cam1".to_string(),
                transport: crate::camera::Transport::LocalDevice,
                connection: "/dev/video0".to_string(),
                manufacturer: None,
                model: None,
                has_ptz: false,
                has_snapshot: true,
                has_video: true,
                observed_at: t,
            })
            .unwrap();
        let new = crate::event::NewEvent {
            id: Uuid::now_v7(),
            camera_id: "cam1".to_string(),
            started_at: t,
            peak_confidence: 0.8,
            class_set: vec!["person".to_string()],
            poster_snapshot_id: None,
        };
        let event_id = new.id;
        db.event().open(&new).unwrap();
        let clip = sample_clip(event_id, t);
        let clip_id = clip.id;
        db.clip().insert(&clip).unwrap();
        db.event().set_clip(event_id, clip_id).unwrap();

        db.clip().delete(clip_id).unwrap();
        assert!(db.clip().get(clip_id).unwrap().is_none());
        assert_eq!(db.event().get(event_id).unwrap().unwrap().clip_id, None);
    }

    #[test]
    fn list_older_than_is_sorted() {
        let mut db = crate::testutil::open_in_memory();
        let t = Timestamp::from_second(1000).unwrap();
        db.camera()
            .register(&crate::camera::Observation {
                id: "cam1".to_string(),
                transport: crate::camera::Transport::LocalDevice,
                connection: "/dev/video0".to_string(),
                manufacturer: None,
                model: None,
                has_ptz: false,
                has_snapshot: true,
                has_video: true,
                observed_at: t,
            })
            .unwrap();
        for secs in [3000i64, 1000, 2000] {
            let new = crate::event::NewEvent {
                id: Uuid::now_v7(),
                camera_id: "cam1".to_string(),
                started_at: t,
                peak_confidence: 0.8,
                class_set: vec!["person".to_string()],
                poster_snapshot_id: None,
            };
            db.event().open(&new).unwrap();
            let clip = sample_clip(new.id, Timestamp::from_second(secs).unwrap());
            db.clip().insert(&clip).unwrap();
        }
        let clips = db.clip().list_older_than(Timestamp::from_second(2500).unwrap()).unwrap();
        assert_eq!(clips.len(), 2);
        assert!(clips[0].ended_at <= clips[1].ended_at);
    }
}
