//! The Event table. The Event Engine is the only writer of event content;
//! the Relay Uploader only ever updates `relay_state`/`relay_attempts`.

use crate::timestamp::{from_row, to_text};
use base::{err, Error, ErrorKind, ResultExt};
use jiff::Timestamp;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayState {
    Pending,
    Uploading,
    Uploaded,
    Failed,
}

impl RelayState {
    fn as_str(self) -> &'static str {
        match self {
            RelayState::Pending => "pending",
            RelayState::Uploading => "uploading",
            RelayState::Uploaded => "uploaded",
            RelayState::Failed => "failed",
        }
    }

    fn parse(s: &str) -> RelayState {
        match s {
            "uploading" => RelayState::Uploading,
            "uploaded" => RelayState::Uploaded,
            "failed" => RelayState::Failed,
            _ => RelayState::Pending,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub camera_id: String,
    pub started_at: Timestamp,
    pub ended_at: Timestamp,
    pub peak_confidence: f64,
    pub class_set: Vec<String>,
    pub poster_snapshot_id: Option<Uuid>,
    pub clip_id: Option<Uuid>,
    pub relay_state: RelayState,
    pub relay_attempts: i64,
}

/// Everything the Event Engine knows when a detection burst opens a new event.
pub struct NewEvent {
    pub id: Uuid,
    pub camera_id: String,
    pub started_at: Timestamp,
    pub peak_confidence: f64,
    pub class_set: Vec<String>,
    pub poster_snapshot_id: Option<Uuid>,
}

fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<Event> {
    let class_set: String = row.get("class_set")?;
    Ok(Event {
        id: parse_uuid(row, "id")?,
        camera_id: row.get("camera_id")?,
        started_at: from_row(row, "started_at")?,
        ended_at: from_row(row, "ended_at")?,
        peak_confidence: row.get("peak_confidence")?,
        class_set: serde_json::from_str(&class_set).unwrap_or_default(),
        poster_snapshot_id: parse_uuid_opt(row, "poster_snapshot_id")?,
        clip_id: parse_uuid_opt(row, "clip_id")?,
        relay_state: RelayState::parse(&row.get::<_, String>("relay_state")?),
        relay_attempts: row.get("relay_attempts")?,
    })
}

fn parse_uuid(row: &rusqlite::Row, col: &str) -> rusqlite::Result<Uuid> {
    let s: String = row.get(col)?;
    s.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(s.len(), rusqlite::types::Type::Text, Box::new(e)))
}

fn parse_uuid_opt(row: &rusqlite::Row, col: &str) -> rusqlite::Result<Option<Uuid>> {
    let s: Option<String> = row.get(col)?;
    s.map(|s| {
        s.parse()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(s.len(), rusqlite::types::Type::Text, Box::new(e)))
    })
    .transpose()
}

pub struct Store<'a> {
    conn: &'a mut rusqlite::Connection,
}

impl<'a> Store<'a> {
    pub(crate) fn new(conn: &'a mut rusqlite::Connection) -> Self {
        Store { conn }
    }

    pub fn get(&self, id: Uuid) -> Result<Option<Event>, Error> {
        self.conn
            .query_row("select * from event where id = ?", params![id.to_string()], row_to_event)
            .optional()
            .err_kind(ErrorKind::Internal)
    }

    /// Inserts a newly opened event row. `started_at ≤ ended_at` is
    /// maintained by seeding `ended_at = started_at`.
    pub fn open(&self, new: &NewEvent) -> Result<(), Error> {
        if new.class_set.is_empty() {
            return Err(err!(InvalidArgument, "event class_set must be non-empty"));
        }
        self.conn
            .execute(
                r#"
                insert into event (
                  id, camera_id, started_at, ended_at, peak_confidence, class_set,
                  poster_snapshot_id, clip_id, relay_state, relay_attempts
                ) values (?1, ?2, ?3, ?3, ?4, ?5, ?6, null, 'pending', 0)
                "#,
                params![
                    new.id.to_string(),
                    new.camera_id,
                    to_text(new.started_at),
                    new.peak_confidence,
                    serde_json::to_string(&new.class_set).unwrap(),
                    new.poster_snapshot_id.map(|u| u.to_string()),
                ],
            )
            .err_kind(ErrorKind::Internal)?;
        Ok(())
    }

    /// Extends an open event with a later detection: bumps `ended_at`,
    /// raises `peak_confidence` if higher, and unions `class_set`.
    pub fn extend(&self, id: Uuid, ended_at: Timestamp, confidence: f64, classes: &[String]) -> Result<(), Error> {
        let mut ev = self
            .get(id)?
            .ok_or_else(|| err!(NotFound, "event {id} not found"))?;
        ev.ended_at = ended_at;
        ev.peak_confidence = ev.peak_confidence.max(confidence);
        for c in classes {
            if !ev.class_set.iter().any(|existing| existing == c) {
                ev.class_set.push(c.clone());
            }
        }
        self.conn
            .execute(
                "update event set ended_at = ?, peak_confidence = ?, class_set = ? where id = ?",
                params![
                    to_text(ev.ended_at),
                    ev.peak_confidence,
                    serde_json::to_string(&ev.class_set).unwrap(),
                    id.to_string(),
                ],
            )
            .err_kind(ErrorKind::Internal)?;
        Ok(())
    }

    /// Attaches a finalized clip to an event. Not called at all when
    /// finalization failed; the event is simply left with `clip_id = null`.
    pub fn set_clip(&self, id: Uuid, clip_id: Uuid) -> Result<(), Error> {
        self.conn
            .execute(
                "update event set clip_id = ? where id = ?",
                params![clip_id.to_string(), id.to_string()],
            )
            .err_kind(ErrorKind::Internal)?;
        Ok(())
    }

    pub fn set_relay_state(&self, id: Uuid, state: RelayState) -> Result<(), Error> {
        self.conn
            .execute(
                "update event set relay_state = ? where id = ?",
                params![state.as_str(), id.to_string()],
            )
            .err_kind(ErrorKind::Internal)?;
        Ok(())
    }

    /// Records a failed upload attempt, putting the event back to
    /// `relay_state = pending` for the uploader's backoff to retry (§4.5:
    /// retryable failures keep the event `pending` with `attempts++`).
    pub fn record_retry(&self, id: Uuid) -> Result<(), Error> {
        self.conn
            .execute(
                "update event set relay_attempts = relay_attempts + 1, relay_state = 'pending' where id = ?",
                params![id.to_string()],
            )
            .err_kind(ErrorKind::Internal)?;
        Ok(())
    }

    /// Oldest-first events still needing upload, for the Relay Uploader's
    /// dequeue loop. Read-only: a candidate returned here isn't claimed yet,
    /// so callers must still win the race via [`Self::claim`] before
    /// dispatching it to a worker.
    pub fn list_for_relay(&self, limit: u32) -> Result<Vec<Event>, Error> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "select * from event where relay_state in ('pending', 'failed') order by started_at limit ?",
            )
            .err_kind(ErrorKind::Internal)?;
        let rows = stmt
            .query_map(params![limit], row_to_event)
            .err_kind(ErrorKind::Internal)?;
        rows.collect::<Result<_, _>>().err_kind(ErrorKind::Internal)
    }

    /// Atomically moves one event from `pending`/`failed` to `uploading`,
    /// returning the claimed row, or `None` if another worker already
    /// claimed it (or it's no longer in an upload-eligible state). This is
    /// the only thing standing between `relay.workers > 1` and two workers
    /// uploading the same event concurrently.
    pub fn claim(&self, id: Uuid) -> Result<Option<Event>, Error> {
        self.conn
            .query_row(
                "update event set relay_state = 'uploading'
                 where id = ? and relay_state in ('pending', 'failed')
                 returning *",
                params![id.to_string()],
                row_to_event,
            )
            .optional()
            .err_kind(ErrorKind::Internal)
    }

    /// Paginated listing for the Read API's `GET /api/events`.
    pub fn list(&self, camera_id: Option<&str>, since: Option<Timestamp>, limit: u32) -> Result<Vec<Event>, Error> {
        let mut stmt = self
            .conn
            .prepare_cached(
                r#"
                select * from event
                where (?1 is null or camera_id = ?1)
                  and (?2 is null or started_at >= ?2)
                order by started_at desc
                limit ?3
                "#,
            )
            .err_kind(ErrorKind::Internal)?;
        let rows = stmt
            .query_map(params![camera_id, since.map(to_text), limit], row_to_event)
            .err_kind(ErrorKind::Internal)?;
        rows.collect::<Result<_, _>>().err_kind(ErrorKind::Internal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_event(camera: &str, started_at: Timestamp) -> NewEvent {
        NewEvent {
            id: Uuid::now_v7(),
            camera_id: camera.to_string(),
            started_at,
            peak_confidence: 0.8,
            class_set: vec!["person".to_string()],
            poster_snapshot_id: None,
        }
    }

    fn with_camera(db: &mut crate::Database, id: &str, t: Timestamp) {
        db.camera()
            .register(&crate::camera::Observation {
                id: id.to_string(),
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
    }

    #[test]
    fn open_requires_nonempty_class_set() {
        let mut db = crate::testutil::open_in_memory();
        let t = Timestamp::from_second(1000).unwrap();
        with_camera(&mut db, "cam1", t);
        let mut new = new_event("cam1", t);
        new.class_set.clear();
        assert_eq!(db.event().open(&new).unwrap_err().kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn extend_unions_classes_and_raises_peak() {
        let mut db = crate::testutil::open_in_memory();
        let t0 = Timestamp::from_second(1000).unwrap();
        let t1 = Timestamp::from_second(1001).unwrap();
        with_camera(&mut db, "cam1", t0);
        let new = new_event("cam1", t0);
        let id = new.id;
        db.event().open(&new).unwrap();
        db.event().extend(id, t1, 0.95, &["car".to_string()]).unwrap();

        let ev = db.event().get(id).unwrap().unwrap();
        assert_eq!(ev.ended_at, t1);
        assert_eq!(ev.peak_confidence, 0.95);
        assert!(ev.class_set.contains(&"person".to_string()));
        assert!(ev.class_set.contains(&"car".to_string()));
        assert!(ev.started_at <= ev.ended_at);
    }

    #[test]
    fn list_for_relay_is_oldest_first() {
        let mut db = crate::testutil::open_in_memory();
        let t0 = Timestamp::from_second(1000).unwrap();
        with_camera(&mut db, "cam1", t0);
        let e1 = new_event("cam1", Timestamp::from_second(2000).unwrap());
        let e2 = new_event("cam1", Timestamp::from_second(1000).unwrap());
        db.event().open(&e1).unwrap();
        db.event().open(&e2).unwrap();
        let pending = db.event().list_for_relay(10).unwrap();
        assert_eq!(pending[0].id, e2.id);
        assert_eq!(pending[1].id, e1.id);
    }
}
