//! `jiff::Timestamp` <-> SQLite text column helpers.
//!
//! `rusqlite` has no built-in `jiff` support, so timestamps are stored as
//! RFC 3339 text (sortable lexicographically, which is what the `event` and
//! `clip` indices rely on for `order by started_at`).

use jiff::Timestamp;

pub(crate) fn to_text(ts: Timestamp) -> String {
    ts.to_string()
}

pub(crate) fn from_text(s: &str) -> rusqlite::Result<Timestamp> {
    s.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(s.len(), rusqlite::types::Type::Text, Box::new(e)))
}

pub(crate) fn from_row(row: &rusqlite::Row, col: &str) -> rusqlite::Result<Timestamp> {
    from_text(&row.get::<_, String>(col)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let t = Timestamp::from_second(1_700_000_000).unwrap();
        let text = to_text(t);
        assert_eq!(from_text(&text).unwrap(), t);
    }
}
