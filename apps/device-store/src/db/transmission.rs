//! Upload ledger for survey files.
//!
//! The tracker never retries anything itself. It records the last known
//! status of each file so the upload subsystem can decide what to resend.

use rusqlite::{params, params_from_iter, Connection, Row};
use survey_core::{FileTransmission, TransmissionStatus};
use tracing::{debug, warn};

use crate::db::date_utils::now_millis;
use crate::db::error::DbError;
use crate::db::repository::SurveyStore;

type Result<T> = std::result::Result<T, DbError>;

/// Repository for file transmissions.
pub trait TransmissionTracker {
    /// Register a file upload, replacing any previous entry for the same filename.
    fn create_transmission(
        &self,
        survey_instance_id: Option<i64>,
        form_id: Option<&str>,
        filename: &str,
        status: TransmissionStatus,
    ) -> Result<()>;

    /// Move a file to `status`. Returns the number of rows touched, 0 for an unknown file.
    fn mark_transmission_status(&self, filename: &str, status: TransmissionStatus)
        -> Result<usize>;

    /// Mark a file FAILED, creating an ownerless entry if the file was never registered.
    fn record_failure(&self, filename: &str) -> Result<()>;

    /// Transmissions in FAILED, IN_PROGRESS or QUEUED state.
    fn list_unsynced(&self) -> Result<Vec<FileTransmission>>;

    fn transmissions_for_instance(&self, survey_instance_id: i64) -> Result<Vec<FileTransmission>>;
}

const TRANSMISSION_COLUMNS: &str =
    "id, survey_instance_id, survey_id, filename, status, start_date, end_date";

fn row_to_transmission(row: &Row) -> rusqlite::Result<FileTransmission> {
    let code: i32 = row.get(4)?;
    let status = TransmissionStatus::from_code(code).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Integer, Box::new(e))
    })?;
    Ok(FileTransmission {
        id: row.get(0)?,
        survey_instance_id: row.get(1)?,
        form_id: row.get(2)?,
        filename: row.get(3)?,
        status,
        start_date: row.get(5)?,
        end_date: row.get(6)?,
    })
}

fn insert_transmission(
    conn: &Connection,
    survey_instance_id: Option<i64>,
    form_id: Option<&str>,
    filename: &str,
    status: TransmissionStatus,
) -> Result<()> {
    let (start_date, end_date) = match status {
        TransmissionStatus::Synced => {
            let now = now_millis();
            (Some(now), Some(now))
        }
        _ => (None, None),
    };
    conn.execute(
        "INSERT INTO transmissions (survey_instance_id, survey_id, filename, status, start_date, end_date)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT (filename) DO UPDATE SET
            survey_instance_id = excluded.survey_instance_id,
            survey_id = excluded.survey_id,
            status = excluded.status,
            start_date = excluded.start_date,
            end_date = excluded.end_date",
        params![survey_instance_id, form_id, filename, status.code(), start_date, end_date],
    )?;
    debug!(filename, ?status, "transmission registered");
    Ok(())
}

fn update_status(conn: &Connection, filename: &str, status: TransmissionStatus) -> Result<usize> {
    let updated = match status {
        TransmissionStatus::InProgress => conn.execute(
            "UPDATE transmissions SET status = ?1, start_date = ?2 WHERE filename = ?3",
            params![status.code(), now_millis(), filename],
        )?,
        TransmissionStatus::Synced => conn.execute(
            "UPDATE transmissions SET status = ?1, end_date = ?2 WHERE filename = ?3",
            params![status.code(), now_millis(), filename],
        )?,
        TransmissionStatus::Queued | TransmissionStatus::Failed => conn.execute(
            "UPDATE transmissions SET status = ?1 WHERE filename = ?2",
            params![status.code(), filename],
        )?,
    };
    Ok(updated)
}

impl TransmissionTracker for SurveyStore {
    fn create_transmission(
        &self,
        survey_instance_id: Option<i64>,
        form_id: Option<&str>,
        filename: &str,
        status: TransmissionStatus,
    ) -> Result<()> {
        let conn = self.handle().conn()?;
        insert_transmission(&conn, survey_instance_id, form_id, filename, status)
    }

    fn mark_transmission_status(
        &self,
        filename: &str,
        status: TransmissionStatus,
    ) -> Result<usize> {
        let conn = self.handle().conn()?;
        update_status(&conn, filename, status)
    }

    fn record_failure(&self, filename: &str) -> Result<()> {
        let mut conn = self.handle().conn()?;
        let tx = conn.transaction()?;
        if update_status(&tx, filename, TransmissionStatus::Failed)? == 0 {
            warn!(filename, "failure reported for unregistered file, recording without owner");
            insert_transmission(&tx, None, None, filename, TransmissionStatus::Failed)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn list_unsynced(&self) -> Result<Vec<FileTransmission>> {
        let statuses = TransmissionStatus::unsynced();
        let conn = self.handle().conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TRANSMISSION_COLUMNS} FROM transmissions
             WHERE status IN (?1, ?2, ?3) ORDER BY id"
        ))?;
        let transmissions = stmt
            .query_map(params_from_iter(statuses.iter().map(|s| s.code())), row_to_transmission)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(transmissions)
    }

    fn transmissions_for_instance(&self, survey_instance_id: i64) -> Result<Vec<FileTransmission>> {
        let conn = self.handle().conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TRANSMISSION_COLUMNS} FROM transmissions
             WHERE survey_instance_id = ?1 ORDER BY id"
        ))?;
        let transmissions = stmt
            .query_map(params![survey_instance_id], row_to_transmission)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(transmissions)
    }
}
