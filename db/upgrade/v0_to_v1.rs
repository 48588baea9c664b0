//! Creates the Camera, Event, Clip, and Snapshot tables.

use base::{Error, ErrorKind, ResultExt};

pub(super) fn run(tx: &rusqlite::Transaction) -> Result<(), Error> {
    tx.execute_batch(
        r#"
        create table camera (
          id                 text primary key,
          transport          text not null check (transport in ('rtsp', 'local-device')),
          connection         text not null,
          credentials_user   text,
          credentials_pass   text,
          manufacturer       text,
          model              text,
          has_ptz            integer not null default 0,
          has_snapshot       integer not null default 0,
          has_video          integer not null default 0,
          first_seen         text not null,
          last_seen          text not null,
          enabled            integer not null default 1,
          status             text not null default 'new',
          deleted            integer not null default 0
        );

        create table clip (
          id              text primary key,
          event_id        text unique not null,
          path            text not null,
          unsealed_size   integer not null,
          sealed_size     integer not null,
          duration_ms     integer not null,
          started_at      text not null,
          ended_at        text not null,
          key_hash        text not null
        );

        create table event (
          id                text primary key,
          camera_id         text not null references camera (id),
          started_at        text not null,
          ended_at          text not null,
          peak_confidence   real not null,
          class_set         text not null,
          poster_snapshot_id text,
          clip_id           text references clip (id),
          relay_state       text not null default 'pending'
                              check (relay_state in ('pending', 'uploading', 'uploaded', 'failed')),
          relay_attempts    integer not null default 0,
          check (started_at <= ended_at)
        );
        create index event_camera_started on event (camera_id, started_at);
        create index event_relay_state on event (relay_state);

        create table snapshot (
          id            text primary key,
          camera_id     text not null references camera (id),
          captured_at   text not null,
          label         text not null default 'normal'
                          check (label in ('normal', 'threat', 'abnormal', 'custom')),
          custom_label  text,
          description   text,
          metadata      text not null default '{}'
        );
        "#,
    )
    .err_kind(ErrorKind::StorageInitFailed)?;
    Ok(())
}
