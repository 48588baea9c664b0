//! The Camera table: the Camera Manager's persisted view of discovered and
//! registered cameras. The Camera Manager is the sole writer; Discovery only
//! ever produces ephemeral observations that the manager reconciles here.

use crate::timestamp::{from_row, to_text};
use base::{Error, ErrorKind, ResultExt};
use jiff::Timestamp;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Transport {
    Rtsp,
    LocalDevice,
}

impl Transport {
    fn as_str(self) -> &'static str {
        match self {
            Transport::Rtsp => "rtsp",
            Transport::LocalDevice => "local-device",
        }
    }

    fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "rtsp" => Ok(Transport::Rtsp),
            "local-device" => Ok(Transport::LocalDevice),
            other => Err(base::err!(Internal, "unknown transport {other:?} in camera row")),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    New,
    Active,
    Stale,
    Unreachable,
    Degraded,
    NeedsCredentials,
}

impl Status {
    fn as_str(self) -> &'static str {
        match self {
            Status::New => "new",
            Status::Active => "active",
            Status::Stale => "stale",
            Status::Unreachable => "unreachable",
            Status::Degraded => "degraded",
            Status::NeedsCredentials => "needs_credentials",
        }
    }

    fn parse(s: &str) -> Status {
        match s {
            "active" => Status::Active,
            "stale" => Status::Stale,
            "unreachable" => Status::Unreachable,
            "degraded" => Status::Degraded,
            "needs_credentials" => Status::NeedsCredentials,
            _ => Status::New,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Camera {
    pub id: String,
    pub transport: Transport,
    pub connection: String,
    pub credentials_user: Option<String>,
    pub credentials_pass: Option<String>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub has_ptz: bool,
    pub has_snapshot: bool,
    pub has_video: bool,
    pub first_seen: Timestamp,
    pub last_seen: Timestamp,
    pub enabled: bool,
    pub status: Status,
}

fn row_to_camera(row: &rusqlite::Row) -> rusqlite::Result<Camera> {
    Ok(Camera {
        id: row.get("id")?,
        transport: Transport::parse(&row.get::<_, String>("transport")?)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
        connection: row.get("connection")?,
        credentials_user: row.get("credentials_user")?,
        credentials_pass: row.get("credentials_pass")?,
        manufacturer: row.get("manufacturer")?,
        model: row.get("model")?,
        has_ptz: row.get("has_ptz")?,
        has_snapshot: row.get("has_snapshot")?,
        has_video: row.get("has_video")?,
        first_seen: from_row(row, "first_seen")?,
        last_seen: from_row(row, "last_seen")?,
        enabled: row.get("enabled")?,
        status: Status::parse(&row.get::<_, String>("status")?),
    })
}

/// A single observation from Discovery, reconciled into the [`Camera`] table
/// by [`Store::reconcile`].
pub struct Observation {
    pub id: String,
    pub transport: Transport,
    pub connection: String,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub has_ptz: bool,
    pub has_snapshot: bool,
    pub has_video: bool,
    pub observed_at: Timestamp,
}

/// The outcome of one reconciliation pass, for the caller to act on (e.g.
/// request pipeline start for `new`, teardown for cameras that just crossed
/// the grace period).
#[derive(Default)]
pub struct Reconciliation {
    pub new: Vec<String>,
    pub still_present: Vec<String>,
    pub missing: Vec<String>,
}

pub struct Store<'a> {
    conn: &'a rusqlite::Connection,
}

impl<'a> Store<'a> {
    pub(crate) fn new(conn: &'a rusqlite::Connection) -> Self {
        Store { conn }
    }

    pub fn list(&self) -> Result<Vec<Camera>, Error> {
        let mut stmt = self
            .conn
            .prepare_cached("select * from camera where deleted = 0 order by id")
            .err_kind(ErrorKind::Internal)?;
        let rows = stmt
            .query_map(params![], row_to_camera)
            .err_kind(ErrorKind::Internal)?;
        rows.collect::<Result<_, _>>().err_kind(ErrorKind::Internal)
    }

    pub fn get(&self, id: &str) -> Result<Option<Camera>, Error> {
        self.conn
            .query_row(
                "select * from camera where id = ? and deleted = 0",
                params![id],
                row_to_camera,
            )
            .optional()
            .err_kind(ErrorKind::Internal)
    }

    /// Idempotent upsert: updates mutable fields if `camera_id` is already
    /// known, preserving `first_seen`; inserts a new row otherwise.
    pub fn register(&self, obs: &Observation) -> Result<(), Error> {
        self.conn
            .execute(
                r#"
                insert into camera (
                  id, transport, connection, manufacturer, model,
                  has_ptz, has_snapshot, has_video, first_seen, last_seen,
                  enabled, status
                ) values (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9, 1, 'active')
                on conflict (id) do update set
                  transport = excluded.transport,
                  connection = excluded.connection,
                  manufacturer = excluded.manufacturer,
                  model = excluded.model,
                  has_ptz = excluded.has_ptz,
                  has_snapshot = excluded.has_snapshot,
                  has_video = excluded.has_video,
                  last_seen = excluded.last_seen,
                  status = case when camera.status = 'stale' then 'active' else camera.status end,
                  deleted = 0
                "#,
                params![
                    obs.id,
                    obs.transport.as_str(),
                    obs.connection,
                    obs.manufacturer,
                    obs.model,
                    obs.has_ptz,
                    obs.has_snapshot,
                    obs.has_video,
                    to_text(obs.observed_at),
                ],
            )
            .err_kind(ErrorKind::Internal)?;
        Ok(())
    }

    /// Three-way reconciliation of `observed` against the persisted table:
    /// `new` (insert), `still_present` (refresh `last_seen`), `missing`
    /// (caller decides grace-period teardown).
    pub fn reconcile(&self, observed: &[Observation]) -> Result<Reconciliation, Error> {
        let known: std::collections::HashSet<String> = self
            .list()?
            .into_iter()
            .map(|c| c.id)
            .collect();
        let mut out = Reconciliation::default();
        let mut seen = std::collections::HashSet::new();
        for obs in observed {
            seen.insert(obs.id.clone());
            if known.contains(&obs.id) {
                out.still_present.push(obs.id.clone());
            } else {
                out.new.push(obs.id.clone());
            }
            self.register(obs)?;
        }
        for id in known.difference(&seen) {
            out.missing.push(id.clone());
        }
        Ok(out)
    }

    pub fn mark_stale(&self, id: &str) -> Result<(), Error> {
        self.conn
            .execute(
                "update camera set status = 'stale' where id = ? and deleted = 0",
                params![id],
            )
            .err_kind(ErrorKind::Internal)?;
        Ok(())
    }

    pub fn set_status(&self, id: &str, status: Status) -> Result<(), Error> {
        self.conn
            .execute(
                "update camera set status = ? where id = ?",
                params![status.as_str(), id],
            )
            .err_kind(ErrorKind::Internal)?;
        Ok(())
    }

    /// Sets the credentials an operator supplied out-of-band (config), used
    /// by Stream Ingest to build the authenticated stream URL. Clears a
    /// `needs_credentials` status back to `active`.
    pub fn set_credentials(&self, id: &str, user: Option<&str>, pass: Option<&str>) -> Result<(), Error> {
        let n = self
            .conn
            .execute(
                r#"
                update camera set credentials_user = ?, credentials_pass = ?,
                  status = case when status = 'needs_credentials' then 'active' else status end
                where id = ? and deleted = 0
                "#,
                params![user, pass, id],
            )
            .err_kind(ErrorKind::Internal)?;
        if n == 0 {
            return Err(base::err!(NotFound, "camera {id} not found"));
        }
        Ok(())
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), Error> {
        let n = self
            .conn
            .execute(
                "update camera set enabled = ? where id = ? and deleted = 0",
                params![enabled, id],
            )
            .err_kind(ErrorKind::Internal)?;
        if n == 0 {
            return Err(base::err!(NotFound, "camera {id} not found"));
        }
        Ok(())
    }

    /// Stops the pipeline (caller's responsibility) and soft-deletes the row;
    /// historical events referencing this `camera_id` are retained.
    pub fn remove(&self, id: &str) -> Result<(), Error> {
        self.conn
            .execute(
                "update camera set deleted = 1, enabled = 0 where id = ?",
                params![id],
            )
            .err_kind(ErrorKind::Internal)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(id: &str, t: Timestamp) -> Observation {
        Observation {
            id: id.to_string(),
            transport: Transport::LocalDevice,
            connection: "/dev/video0".to_string(),
            manufacturer: None,
            model: None,
            has_ptz: false,
            has_snapshot: true,
            has_video: true,
            observed_at: t,
        }
    }

    #[test]
    fn register_is_idempotent_and_preserves_first_seen() {
        let mut db = crate::testutil::open_in_memory();
        let t0 = Timestamp::from_second(1000).unwrap();
        let t1 = Timestamp::from_second(2000).unwrap();
        db.camera().register(&obs("cam1", t0)).unwrap();
        db.camera().register(&obs("cam1", t1)).unwrap();
        let cams = db.camera().list().unwrap();
        assert_eq!(cams.len(), 1);
        assert_eq!(cams[0].first_seen, t0);
        assert_eq!(cams[0].last_seen, t1);
    }

    #[test]
    fn reconcile_buckets_new_present_missing() {
        let mut db = crate::testutil::open_in_memory();
        let t = Timestamp::from_second(1000).unwrap();
        db.camera().register(&obs("cam1", t)).unwrap();
        let r = db.camera().reconcile(&[obs("cam1", t), obs("cam2", t)]).unwrap();
        assert_eq!(r.still_present, vec!["cam1".to_string()]);
        assert_eq!(r.new, vec!["cam2".to_string()]);
        assert!(r.missing.is_empty());

        let r2 = db.camera().reconcile(&[obs("cam2", t)]).unwrap();
        assert_eq!(r2.missing, vec!["cam1".to_string()]);
    }

    #[test]
    fn remove_soft_deletes() {
        let mut db = crate::testutil::open_in_memory();
        let t = Timestamp::from_second(1000).unwrap();
        db.camera().register(&obs("cam1", t)).unwrap();
        db.camera().remove("cam1").unwrap();
        assert!(db.camera().list().unwrap().is_empty());
        assert!(db.camera().get("cam1").unwrap().is_none());
    }
}
