//! The Snapshot table: event poster frames plus user-labeled frames kept for
//! training export.

use crate::timestamp::from_row;
use base::{Error, ErrorKind, ResultExt};
use jiff::Timestamp;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    Normal,
    Threat,
    Abnormal,
    Custom,
}

impl Label {
    fn as_str(self) -> &'static str {
        match self {
            Label::Normal => "normal",
            Label::Threat => "threat",
            Label::Abnormal => "abnormal",
            Label::Custom => "custom",
        }
    }

    fn parse(s: &str) -> Label {
        match s {
            "threat" => Label::Threat,
            "abnormal" => Label::Abnormal,
            "custom" => Label::Custom,
            _ => Label::Normal,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: Uuid,
    pub camera_id: String,
    pub captured_at: Timestamp,
    pub label: Label,
    pub custom_label: Option<String>,
    pub description: Option<String>,
    pub metadata: serde_json::Value,
}

fn row_to_snapshot(row: &rusqlite::Row) -> rusqlite::Result<Snapshot> {
    let id: String = row.get("id")?;
    let metadata: String = row.get("metadata")?;
    Ok(Snapshot {
        id: id
            .parse()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(id.len(), rusqlite::types::Type::Text, Box::new(e)))?,
        camera_id: row.get("camera_id")?,
        captured_at: from_row(row, "captured_at")?,
        label: Label::parse(&row.get::<_, String>("label")?),
        custom_label: row.get("custom_label")?,
        description: row.get("description")?,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
    })
}

pub struct Store<'a> {
    conn: &'a mut rusqlite::Connection,
}

impl<'a> Store<'a> {
    pub(crate) fn new(conn: &'a mut rusqlite::Connection) -> Self {
        Store { conn }
    }

    pub fn insert(&self, s: &Snapshot) -> Result<(), Error> {
        self.conn
            .execute(
                r#"
                insert into snapshot (id, camera_id, captured_at, label, custom_label, description, metadata)
                values (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    s.id.to_string(),
                    s.camera_id,
                    crate::timestamp::to_text(s.captured_at),
                    s.label.as_str(),
                    s.custom_label,
                    s.description,
                    serde_json::to_string(&s.metadata).unwrap(),
                ],
            )
            .err_kind(ErrorKind::Internal)?;
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Result<Option<Snapshot>, Error> {
        self.conn
            .query_row(
                "select * from snapshot where id = ?",
                params![id.to_string()],
                row_to_snapshot,
            )
            .optional()
            .err_kind(ErrorKind::Internal)
    }

    pub fn set_label(&self, id: Uuid, label: Label, custom_label: Option<&str>) -> Result<(), Error> {
        self.conn
            .execute(
                "update snapshot set label = ?, custom_label = ? where id = ?",
                params![label.as_str(), custom_label, id.to_string()],
            )
            .err_kind(ErrorKind::Internal)?;
        Ok(())
    }

    pub fn list_for_camera(&self, camera_id: &str) -> Result<Vec<Snapshot>, Error> {
        let mut stmt = self
            .conn
            .prepare_cached("select * from snapshot where camera_id = ? order by captured_at desc")
            .err_kind(ErrorKind::Internal)?;
        let rows = stmt
            .query_map(params![camera_id], row_to_snapshot)
            .err_kind(ErrorKind::Internal)?;
        rows.collect::<Result<_, _>>().err_kind(ErrorKind::Internal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_relabel() {
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
        let snap = Snapshot {
            id: Uuid::now_v7(),
            camera_id: "cam1".to_string(),
            captured_at: t,
            label: Label::Normal,
            custom_label: None,
            description: None,
            metadata: serde_json::json!({}),
        };
        let id = snap.id;
        db.snapshot().insert(&snap).unwrap();
        db.snapshot().set_label(id, Label::Threat, None).unwrap();
        let got = db.snapshot().get(id).unwrap().unwrap();
        assert_eq!(got.label, Label::Threat);
    }
}
