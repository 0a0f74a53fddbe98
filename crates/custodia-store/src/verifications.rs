use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::error::Result;
use crate::models::{decode_text, decode_ts, encode_ts, VerificationRecord};

const SELECT_RECORD: &str = "SELECT file_name, outcome, integrity, scan_result, actual_hash,
            expected_hash, message, timestamp
     FROM verifications";

impl Database {
    /// Append a verification record. Records are never overwritten.
    pub fn append_verification(&self, record: &VerificationRecord) -> Result<()> {
        self.conn().execute(
            "INSERT INTO verifications
                (file_name, outcome, integrity, scan_result, actual_hash, expected_hash, message, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.file_name,
                record.outcome.as_str(),
                record.integrity.as_str(),
                record.scan_result.as_str(),
                record.actual_hash,
                record.expected_hash,
                record.message,
                encode_ts(&record.timestamp),
            ],
        )?;
        Ok(())
    }

    /// Most recent record for `file_name` stamped at or after `after`.
    pub fn latest_verification(
        &self,
        file_name: &str,
        after: DateTime<Utc>,
    ) -> Result<Option<VerificationRecord>> {
        let record = self
            .conn()
            .query_row(
                &format!(
                    "{SELECT_RECORD}
                     WHERE file_name = ?1 AND timestamp >= ?2
                     ORDER BY timestamp DESC, id DESC
                     LIMIT 1"
                ),
                params![file_name, encode_ts(&after)],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<VerificationRecord> {
    let file_name: String = row.get(0)?;
    let outcome: String = row.get(1)?;
    let integrity: String = row.get(2)?;
    let scan_result: String = row.get(3)?;
    let actual_hash: Option<String> = row.get(4)?;
    let expected_hash: Option<String> = row.get(5)?;
    let message: String = row.get(6)?;
    let ts: String = row.get(7)?;

    Ok(VerificationRecord {
        file_name,
        outcome: decode_text(1, &outcome)?,
        integrity: decode_text(2, &integrity)?,
        scan_result: decode_text(3, &scan_result)?,
        actual_hash,
        expected_hash,
        message,
        timestamp: decode_ts(7, &ts)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use custodia_shared::verification::{Integrity, Outcome, ScanResult};

    fn record(name: &str, outcome: Outcome, ts: DateTime<Utc>) -> VerificationRecord {
        VerificationRecord {
            file_name: name.to_string(),
            outcome,
            integrity: Integrity::Valid,
            scan_result: ScanResult::Clean,
            actual_hash: Some("ab".repeat(32)),
            expected_hash: None,
            message: "test".into(),
            timestamp: ts,
        }
    }

    #[test]
    fn latest_after_cutoff() {
        let db = Database::open_in_memory().unwrap();
        let t0 = Utc::now();
        db.append_verification(&record("a.txt", Outcome::Corrupt, t0))
            .unwrap();
        db.append_verification(&record("a.txt", Outcome::Ok, t0 + Duration::seconds(5)))
            .unwrap();
        db.append_verification(&record("b.txt", Outcome::Infected, t0 + Duration::seconds(9)))
            .unwrap();

        let latest = db.latest_verification("a.txt", t0).unwrap().unwrap();
        assert_eq!(latest.outcome, Outcome::Ok);

        assert!(db
            .latest_verification("a.txt", t0 + Duration::seconds(6))
            .unwrap()
            .is_none());
        assert!(db.latest_verification("c.txt", t0).unwrap().is_none());
    }

    #[test]
    fn newer_record_supersedes_older() {
        let db = Database::open_in_memory().unwrap();
        let t0 = Utc::now();
        db.append_verification(&record("a.txt", Outcome::Ok, t0)).unwrap();
        db.append_verification(&record("a.txt", Outcome::Corrupt, t0 + Duration::seconds(1)))
            .unwrap();

        let latest = db.latest_verification("a.txt", t0).unwrap().unwrap();
        assert_eq!(latest.outcome, Outcome::Corrupt);

        let count: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM verifications", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }
}
