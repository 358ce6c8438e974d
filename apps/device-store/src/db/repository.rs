//! Repository pattern for survey data access.

use std::collections::HashMap;

use rusqlite::{params, Connection, OptionalExtension, Row};
use survey_core::{
    parse_geolocation, DeviceSettings, GeoPoint, Language, QuestionResponse, Record, RegistrationMeta,
    ResponseKey, Survey, SurveyGroup, SurveyInstance, SurveyInstanceStatus, SyncedTime, User,
    DEFAULT_RESPONSE_TYPE, NOT_REPEATED,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::connection::{ConnectionManager, DbHandle};
use crate::db::date_utils::now_millis;
use crate::db::error::DbError;

type Result<T> = std::result::Result<T, DbError>;

/// Repository for survey metadata.
pub trait SurveyRepository {
    fn add_survey_group(&self, group: &SurveyGroup) -> Result<()>;
    fn get_survey_group(&self, id: i64) -> Result<Option<SurveyGroup>>;
    fn list_survey_groups(&self) -> Result<Vec<SurveyGroup>>;
    fn save_survey(&self, survey: &Survey) -> Result<()>;
    fn get_survey(&self, survey_id: &str) -> Result<Option<Survey>>;
    fn list_surveys(&self, survey_group_id: i64) -> Result<Vec<Survey>>;
    fn fetch_out_of_date_surveys(&self, candidates: &[Survey]) -> Result<Vec<Survey>>;
    fn registration_form(&self, group: &SurveyGroup) -> Result<Option<Survey>>;
    fn mark_survey_help_downloaded(&self, survey_id: &str, downloaded: bool) -> Result<()>;
    fn delete_survey(&self, survey_id: &str) -> Result<()>;
}

/// Repository for survey instances.
pub trait InstanceRepository {
    fn create_survey_instance(
        &self,
        survey_id: &str,
        version: f64,
        user: &User,
        record_id: Option<&str>,
    ) -> Result<i64>;
    fn get_survey_instance(&self, id: i64) -> Result<Option<SurveyInstance>>;
    fn update_instance_status(&self, id: i64, status: SurveyInstanceStatus) -> Result<()>;
    fn add_survey_duration(&self, id: i64, elapsed_millis: i64) -> Result<()>;
    fn instances_by_status(&self, status: SurveyInstanceStatus) -> Result<Vec<SurveyInstance>>;
    fn instances_for_record(&self, record_id: &str) -> Result<Vec<SurveyInstance>>;
    fn last_survey_instance(&self, record_id: &str, survey_id: &str) -> Result<Option<i64>>;
    fn delete_empty_survey_instances(&self) -> Result<usize>;
}

/// Repository for question responses.
pub trait ResponseRepository {
    fn get_responses(&self, survey_instance_id: i64)
        -> Result<HashMap<ResponseKey, QuestionResponse>>;
    fn responses_for_prefilled_survey(
        &self,
        survey_instance_id: i64,
        new_survey_instance_id: i64,
    ) -> Result<HashMap<ResponseKey, QuestionResponse>>;
    fn get_response(&self, survey_instance_id: i64, question_id: &str)
        -> Result<Option<QuestionResponse>>;
    fn save_response(&self, response: &QuestionResponse) -> Result<QuestionResponse>;
    fn delete_response(
        &self,
        survey_instance_id: i64,
        question_id: &str,
        iteration: Option<i32>,
    ) -> Result<usize>;
    fn delete_responses_for_survey(&self, survey_id: &str) -> Result<usize>;
    fn update_registration_meta(
        &self,
        survey_instance_id: i64,
        value: &str,
        meta: RegistrationMeta,
    ) -> Result<Option<QuestionResponse>>;
}

/// Sort order of a data point listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataPointOrder {
    /// Most recently modified first.
    #[default]
    Date,
    /// Case-insensitive by name, unnamed points last.
    Name,
    /// Nearest to an origin first, points without a location last.
    Distance,
}

/// Repository for data point records.
pub trait RecordRepository {
    fn create_record(&self, survey_group_id: i64) -> Result<String>;
    fn get_record(&self, record_id: &str) -> Result<Option<Record>>;
    fn records_for_group(&self, survey_group_id: i64) -> Result<Vec<Record>>;
    /// List a group's data points, optionally narrowed to names containing `filter`.
    ///
    /// [`DataPointOrder::Distance`] without an origin falls back to date order.
    fn data_points(
        &self,
        survey_group_id: i64,
        order: DataPointOrder,
        origin: Option<GeoPoint>,
        filter: Option<&str>,
    ) -> Result<Vec<Record>>;
    fn update_record_modified_date(&self, record_id: &str, timestamp: i64) -> Result<()>;
    fn clear_record_name(&self, survey_instance_id: i64) -> Result<()>;
    fn delete_empty_records(&self) -> Result<usize>;
}

/// Repository for device users.
pub trait UserRepository {
    fn create_or_update_user(&self, id: Option<i64>, name: &str) -> Result<i64>;
    fn get_user(&self, id: i64) -> Result<Option<User>>;
    fn list_users(&self) -> Result<Vec<User>>;
    fn delete_user(&self, id: i64) -> Result<()>;
}

/// Repository for device settings and languages.
pub trait SettingsRepository {
    fn get_settings(&self) -> Result<DeviceSettings>;
    fn save_settings(&self, settings: &DeviceSettings) -> Result<()>;
    fn save_languages(&self, survey_group_id: i64, codes: &[String]) -> Result<()>;
    fn languages(&self, survey_group_id: i64) -> Result<Vec<Language>>;
}

/// Survey instance downloaded with a remote data point.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadedInstance {
    pub uuid: String,
    pub survey_id: String,
    pub record_id: String,
    pub submitter: Option<String>,
    pub submitted_date: Option<i64>,
    pub responses: Vec<QuestionResponse>,
}

/// One fetched batch of remote changes for a survey group.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteBatch {
    pub survey_group_id: i64,
    pub records: Vec<Record>,
    pub instances: Vec<DownloadedInstance>,
    /// Server-reported latest modification time, `None` for an empty batch.
    pub latest_modified: Option<i64>,
}

/// Outcome of merging a remote batch.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct MergeStats {
    pub records_merged: usize,
    pub instances_merged: usize,
    pub responses_merged: usize,
    pub synced_time: Option<i64>,
}

/// Repository for incremental pull-sync state.
pub trait SyncRepository {
    fn synced_time(&self, survey_group_id: i64) -> Result<Option<SyncedTime>>;
    fn merge_remote_batch(&self, batch: &RemoteBatch) -> Result<MergeStats>;
}

/// SQLite implementation of repositories.
pub struct SurveyStore {
    db: DbHandle,
}

impl SurveyStore {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    /// Open a fresh in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(ConnectionManager::in_memory().open()?))
    }

    /// Handle this store reads and writes through.
    pub fn handle(&self) -> &DbHandle {
        &self.db
    }

    /// Delete collected data: instances, responses, records, transmissions and sync marks.
    pub fn clear_collected_data(&self) -> Result<()> {
        let mut conn = self.db.conn()?;
        let tx = conn.transaction()?;
        tx.execute_batch(
            "DELETE FROM responses;
             DELETE FROM survey_instances;
             DELETE FROM records;
             DELETE FROM transmissions;
             DELETE FROM sync_time;",
        )?;
        tx.commit()?;
        info!("collected data cleared");
        Ok(())
    }

    /// Delete collected data plus surveys, groups, users and languages.
    pub fn clear_all_data(&self) -> Result<()> {
        self.clear_collected_data()?;
        let mut conn = self.db.conn()?;
        let tx = conn.transaction()?;
        tx.execute_batch(
            "DELETE FROM surveys;
             DELETE FROM survey_groups;
             DELETE FROM users;
             DELETE FROM languages;",
        )?;
        tx.commit()?;
        info!("all data cleared");
        Ok(())
    }

    fn row_to_survey(row: &Row) -> rusqlite::Result<Survey> {
        Ok(Survey {
            id: row.get(0)?,
            group_id: row.get::<_, Option<i64>>(1)?.unwrap_or(SurveyGroup::ID_NONE),
            name: row.get(2)?,
            version: row.get::<_, Option<f64>>(3)?.unwrap_or_default(),
            survey_type: row.get(4)?,
            location: row.get(5)?,
            filename: row.get(6)?,
            default_language: row.get(7)?,
            help_downloaded: row.get(8)?,
            deleted: row.get(9)?,
        })
    }

    fn row_to_group(row: &Row) -> rusqlite::Result<SurveyGroup> {
        Ok(SurveyGroup {
            id: row.get(0)?,
            name: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
            register_survey_id: row.get(2)?,
            monitored: row.get(3)?,
        })
    }

    fn row_to_instance(row: &Row) -> rusqlite::Result<SurveyInstance> {
        let code: Option<i32> = row.get(9)?;
        let status = match code {
            Some(code) => SurveyInstanceStatus::from_code(code).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Integer, Box::new(e))
            })?,
            None => SurveyInstanceStatus::default(),
        };
        Ok(SurveyInstance {
            id: row.get(0)?,
            uuid: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
            survey_id: row.get(2)?,
            user_id: row.get(3)?,
            start_date: row.get(4)?,
            saved_date: row.get(5)?,
            submitted_date: row.get(6)?,
            record_id: row.get(7)?,
            exported_date: row.get(8)?,
            status,
            sync_date: row.get(10)?,
            duration: row.get(11)?,
            submitter: row.get(12)?,
            version: row.get(13)?,
        })
    }

    fn row_to_response(row: &Row) -> rusqlite::Result<QuestionResponse> {
        Ok(QuestionResponse {
            id: Some(row.get(0)?),
            survey_instance_id: row.get(1)?,
            question_id: row.get(2)?,
            value: row.get(3)?,
            response_type: row.get(4)?,
            include: row.get(5)?,
            filename: row.get(6)?,
            iteration: row.get(7)?,
        })
    }

    fn row_to_record(row: &Row) -> rusqlite::Result<Record> {
        Ok(Record {
            record_id: row.get(0)?,
            survey_group_id: row.get::<_, Option<i64>>(1)?.unwrap_or(SurveyGroup::ID_NONE),
            name: row.get(2)?,
            latitude: row.get(3)?,
            longitude: row.get(4)?,
            last_modified: row.get(5)?,
        })
    }

    fn row_to_user(row: &Row) -> rusqlite::Result<User> {
        Ok(User {
            id: row.get(0)?,
            name: row.get(1)?,
            email: row.get(2)?,
            deleted: row.get(3)?,
        })
    }
}

const SURVEY_COLUMNS: &str = "survey_id, survey_group_id, name, version, type, location, filename, language, help_downloaded, deleted";

const INSTANCE_COLUMNS: &str = "id, uuid, survey_id, user_id, start_date, saved_date, submitted_date, record_id, exported_date, status, sync_date, duration, submitter, version";

const RESPONSE_COLUMNS: &str =
    "id, survey_instance_id, question_id, answer, type, include, filename, iteration";

const RECORD_COLUMNS: &str = "record_id, survey_group_id, name, latitude, longitude, last_modified";

/// Escape `LIKE` wildcards so a search term matches literally.
fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Insert or update a response by its identity key.
///
/// Repeatable-group answers are matched on (instance, question, iteration),
/// everything else on (instance, question). A matched row keeps its id, its
/// iteration and, unless the caller supplies one, its type.
pub(crate) fn upsert_response(
    conn: &Connection,
    response: &QuestionResponse,
) -> Result<QuestionResponse> {
    let existing: Option<(i64, String, i32)> = if response.is_answer_to_repeatable_group() {
        conn.query_row(
            "SELECT id, type, iteration FROM responses
             WHERE survey_instance_id = ?1 AND question_id = ?2 AND iteration = ?3
             ORDER BY id LIMIT 1",
            params![response.survey_instance_id, response.question_id, response.iteration],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?
    } else {
        conn.query_row(
            "SELECT id, type, iteration FROM responses
             WHERE survey_instance_id = ?1 AND question_id = ?2
             ORDER BY id LIMIT 1",
            params![response.survey_instance_id, response.question_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?
    };

    match existing {
        Some((id, stored_type, stored_iteration)) => {
            let response_type = response.response_type.clone().unwrap_or(stored_type);
            conn.execute(
                "UPDATE responses SET answer = ?1, type = ?2, filename = ?3, include = ?4, iteration = ?5
                 WHERE id = ?6",
                params![
                    response.value,
                    response_type,
                    response.filename,
                    response.include,
                    stored_iteration,
                    id
                ],
            )?;
            debug!(id, question_id = %response.question_id, "response updated");
            Ok(QuestionResponse {
                id: Some(id),
                response_type: Some(response_type),
                iteration: stored_iteration,
                ..response.clone()
            })
        }
        None => {
            let response_type = response
                .response_type
                .clone()
                .unwrap_or_else(|| DEFAULT_RESPONSE_TYPE.to_string());
            conn.execute(
                "INSERT INTO responses (survey_instance_id, question_id, answer, type, include, filename, iteration)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    response.survey_instance_id,
                    response.question_id,
                    response.value,
                    response_type,
                    response.include,
                    response.filename,
                    response.iteration
                ],
            )?;
            let id = conn.last_insert_rowid();
            debug!(id, question_id = %response.question_id, "response inserted");
            Ok(QuestionResponse {
                id: Some(id),
                response_type: Some(response_type),
                ..response.clone()
            })
        }
    }
}

impl SurveyRepository for SurveyStore {
    fn add_survey_group(&self, group: &SurveyGroup) -> Result<()> {
        self.db.conn()?.execute(
            "INSERT INTO survey_groups (survey_group_id, name, register_survey_id, monitored)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (survey_group_id) DO UPDATE SET
                name = excluded.name,
                register_survey_id = excluded.register_survey_id,
                monitored = excluded.monitored",
            params![group.id, group.name, group.register_survey_id, group.monitored],
        )?;
        Ok(())
    }

    fn get_survey_group(&self, id: i64) -> Result<Option<SurveyGroup>> {
        self.db
            .conn()?
            .query_row(
                "SELECT survey_group_id, name, register_survey_id, monitored
                 FROM survey_groups WHERE survey_group_id = ?1",
                params![id],
                Self::row_to_group,
            )
            .optional()
            .map_err(Into::into)
    }

    fn list_survey_groups(&self) -> Result<Vec<SurveyGroup>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(
            "SELECT survey_group_id, name, register_survey_id, monitored
             FROM survey_groups ORDER BY name",
        )?;
        let groups = stmt
            .query_map([], Self::row_to_group)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(groups)
    }

    fn save_survey(&self, survey: &Survey) -> Result<()> {
        self.db.conn()?.execute(
            "INSERT INTO surveys (survey_id, survey_group_id, name, version, type, location, filename, language, help_downloaded, deleted)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0)
             ON CONFLICT (survey_id) DO UPDATE SET
                survey_group_id = excluded.survey_group_id,
                name = excluded.name,
                version = excluded.version,
                type = excluded.type,
                location = excluded.location,
                filename = excluded.filename,
                language = excluded.language,
                help_downloaded = excluded.help_downloaded,
                deleted = 0",
            params![
                survey.id,
                survey.group_id,
                survey.name,
                survey.version,
                survey.survey_type,
                survey.location,
                survey.filename,
                survey.default_language,
                survey.help_downloaded
            ],
        )?;
        Ok(())
    }

    fn get_survey(&self, survey_id: &str) -> Result<Option<Survey>> {
        self.db
            .conn()?
            .query_row(
                &format!("SELECT {SURVEY_COLUMNS} FROM surveys WHERE survey_id = ?1"),
                params![survey_id],
                Self::row_to_survey,
            )
            .optional()
            .map_err(Into::into)
    }

    fn list_surveys(&self, survey_group_id: i64) -> Result<Vec<Survey>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SURVEY_COLUMNS} FROM surveys
             WHERE survey_group_id = ?1 AND deleted = 0 ORDER BY id"
        ))?;
        let surveys = stmt
            .query_map(params![survey_group_id], Self::row_to_survey)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(surveys)
    }

    /// Surveys that are missing locally or stored with a lower version.
    ///
    /// A locally deleted survey counts as up to date, so sync never resurrects it.
    fn fetch_out_of_date_surveys(&self, candidates: &[Survey]) -> Result<Vec<Survey>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(
            "SELECT COUNT(*) FROM surveys
             WHERE survey_id = ?1 AND (version >= ?2 OR deleted = 1)",
        )?;

        let mut out_of_date = Vec::new();
        for survey in candidates {
            let matching: i64 =
                stmt.query_row(params![survey.id, survey.version], |row| row.get(0))?;
            if matching == 0 {
                out_of_date.push(survey.clone());
            }
        }
        Ok(out_of_date)
    }

    fn registration_form(&self, group: &SurveyGroup) -> Result<Option<Survey>> {
        if let Some(form_id) = group.registration_form_id() {
            return self.get_survey(form_id);
        }
        Ok(self.list_surveys(group.id)?.into_iter().next())
    }

    fn mark_survey_help_downloaded(&self, survey_id: &str, downloaded: bool) -> Result<()> {
        self.db.conn()?.execute(
            "UPDATE surveys SET help_downloaded = ?1 WHERE survey_id = ?2",
            params![downloaded, survey_id],
        )?;
        Ok(())
    }

    /// Logically delete a survey and remove the data collected with it.
    fn delete_survey(&self, survey_id: &str) -> Result<()> {
        let mut conn = self.db.conn()?;
        let tx = conn.transaction()?;
        delete_survey_data(&tx, survey_id)?;
        tx.execute(
            "UPDATE surveys SET deleted = 1 WHERE survey_id = ?1",
            params![survey_id],
        )?;
        tx.commit()?;
        info!(survey_id, "survey deleted");
        Ok(())
    }
}

/// Remove transmissions, responses and instances collected with a survey.
fn delete_survey_data(conn: &Connection, survey_id: &str) -> Result<usize> {
    conn.execute(
        "DELETE FROM transmissions WHERE survey_id = ?1
            OR survey_instance_id IN (SELECT id FROM survey_instances WHERE survey_id = ?1)",
        params![survey_id],
    )?;
    let responses = conn.execute(
        "DELETE FROM responses
         WHERE survey_instance_id IN (SELECT id FROM survey_instances WHERE survey_id = ?1)",
        params![survey_id],
    )?;
    conn.execute(
        "DELETE FROM survey_instances WHERE survey_id = ?1",
        params![survey_id],
    )?;
    Ok(responses)
}

impl InstanceRepository for SurveyStore {
    fn create_survey_instance(
        &self,
        survey_id: &str,
        version: f64,
        user: &User,
        record_id: Option<&str>,
    ) -> Result<i64> {
        let now = now_millis();
        let conn = self.db.conn()?;
        conn.execute(
            "INSERT INTO survey_instances (uuid, survey_id, version, user_id, status, start_date, saved_date, record_id, submitter)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, ?7, ?8)",
            params![
                Uuid::new_v4().to_string(),
                survey_id,
                version,
                user.id,
                SurveyInstanceStatus::Saved.code(),
                now,
                record_id,
                user.name
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn get_survey_instance(&self, id: i64) -> Result<Option<SurveyInstance>> {
        self.db
            .conn()?
            .query_row(
                &format!("SELECT {INSTANCE_COLUMNS} FROM survey_instances WHERE id = ?1"),
                params![id],
                Self::row_to_instance,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Persist a status transition, stamping the date column that belongs to it.
    fn update_instance_status(&self, id: i64, status: SurveyInstanceStatus) -> Result<()> {
        let date_column = match status {
            SurveyInstanceStatus::Saved => Some("saved_date"),
            SurveyInstanceStatus::Submitted => Some("submitted_date"),
            SurveyInstanceStatus::Exported => Some("exported_date"),
            SurveyInstanceStatus::Synced => Some("sync_date"),
            SurveyInstanceStatus::SubmitRequested | SurveyInstanceStatus::Downloaded => None,
        };
        let conn = self.db.conn()?;
        match date_column {
            Some(column) => conn.execute(
                &format!("UPDATE survey_instances SET status = ?1, {column} = ?2 WHERE id = ?3"),
                params![status.code(), now_millis(), id],
            )?,
            None => conn.execute(
                "UPDATE survey_instances SET status = ?1 WHERE id = ?2",
                params![status.code(), id],
            )?,
        };
        Ok(())
    }

    fn add_survey_duration(&self, id: i64, elapsed_millis: i64) -> Result<()> {
        self.db.conn()?.execute(
            "UPDATE survey_instances SET duration = duration + ?1 WHERE id = ?2",
            params![elapsed_millis.max(0), id],
        )?;
        Ok(())
    }

    fn instances_by_status(&self, status: SurveyInstanceStatus) -> Result<Vec<SurveyInstance>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM survey_instances WHERE status = ?1 ORDER BY id"
        ))?;
        let instances = stmt
            .query_map(params![status.code()], Self::row_to_instance)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(instances)
    }

    fn instances_for_record(&self, record_id: &str) -> Result<Vec<SurveyInstance>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM survey_instances
             WHERE record_id = ?1 ORDER BY start_date DESC, id DESC"
        ))?;
        let instances = stmt
            .query_map(params![record_id], Self::row_to_instance)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(instances)
    }

    fn last_survey_instance(&self, record_id: &str, survey_id: &str) -> Result<Option<i64>> {
        self.db
            .conn()?
            .query_row(
                "SELECT id FROM survey_instances
                 WHERE record_id = ?1 AND survey_id = ?2
                 ORDER BY COALESCE(submitted_date, saved_date, start_date) DESC, id DESC
                 LIMIT 1",
                params![record_id, survey_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
    }

    fn delete_empty_survey_instances(&self) -> Result<usize> {
        let deleted = self.db.conn()?.execute(
            "DELETE FROM survey_instances
             WHERE id NOT IN (SELECT DISTINCT survey_instance_id FROM responses)",
            [],
        )?;
        Ok(deleted)
    }
}

impl ResponseRepository for SurveyStore {
    fn get_responses(
        &self,
        survey_instance_id: i64,
    ) -> Result<HashMap<ResponseKey, QuestionResponse>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RESPONSE_COLUMNS} FROM responses WHERE survey_instance_id = ?1"
        ))?;
        let responses = stmt
            .query_map(params![survey_instance_id], Self::row_to_response)?
            .map(|r| r.map(|response| (response.key(), response)))
            .collect::<std::result::Result<HashMap<_, _>, _>>()?;
        Ok(responses)
    }

    fn responses_for_prefilled_survey(
        &self,
        survey_instance_id: i64,
        new_survey_instance_id: i64,
    ) -> Result<HashMap<ResponseKey, QuestionResponse>> {
        let responses = self.get_responses(survey_instance_id)?;
        Ok(survey_core::clone_for_new_instance(
            responses.values(),
            new_survey_instance_id,
        ))
    }

    fn get_response(
        &self,
        survey_instance_id: i64,
        question_id: &str,
    ) -> Result<Option<QuestionResponse>> {
        self.db
            .conn()?
            .query_row(
                &format!(
                    "SELECT {RESPONSE_COLUMNS} FROM responses
                     WHERE survey_instance_id = ?1 AND question_id = ?2
                     ORDER BY id LIMIT 1"
                ),
                params![survey_instance_id, question_id],
                Self::row_to_response,
            )
            .optional()
            .map_err(Into::into)
    }

    fn save_response(&self, response: &QuestionResponse) -> Result<QuestionResponse> {
        let conn = self.db.conn()?;
        upsert_response(&conn, response)
    }

    fn delete_response(
        &self,
        survey_instance_id: i64,
        question_id: &str,
        iteration: Option<i32>,
    ) -> Result<usize> {
        let conn = self.db.conn()?;
        let deleted = match iteration {
            Some(iteration) => conn.execute(
                "DELETE FROM responses
                 WHERE survey_instance_id = ?1 AND question_id = ?2 AND iteration = ?3",
                params![survey_instance_id, question_id, iteration],
            )?,
            None => conn.execute(
                "DELETE FROM responses WHERE survey_instance_id = ?1 AND question_id = ?2",
                params![survey_instance_id, question_id],
            )?,
        };
        Ok(deleted)
    }

    fn delete_responses_for_survey(&self, survey_id: &str) -> Result<usize> {
        let deleted = self.db.conn()?.execute(
            "DELETE FROM responses
             WHERE survey_instance_id IN (SELECT id FROM survey_instances WHERE survey_id = ?1)",
            params![survey_id],
        )?;
        Ok(deleted)
    }

    /// Store a registration name or geolocation on both the record and the
    /// instance's synthetic metadata response.
    ///
    /// An empty value is ignored. A geolocation without both coordinates is
    /// rejected before anything is written.
    fn update_registration_meta(
        &self,
        survey_instance_id: i64,
        value: &str,
        meta: RegistrationMeta,
    ) -> Result<Option<QuestionResponse>> {
        if value.is_empty() {
            return Ok(None);
        }
        let point = match meta {
            RegistrationMeta::Geolocation => Some(parse_geolocation(value)?),
            RegistrationMeta::Name => None,
        };

        let mut conn = self.db.conn()?;
        let tx = conn.transaction()?;

        let record_id: Option<String> = tx
            .query_row(
                "SELECT record_id FROM survey_instances WHERE id = ?1",
                params![survey_instance_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();

        if let Some(record_id) = &record_id {
            match point {
                Some(point) => tx.execute(
                    "UPDATE records SET latitude = ?1, longitude = ?2 WHERE record_id = ?3",
                    params![point.latitude, point.longitude, record_id],
                )?,
                None => tx.execute(
                    "UPDATE records SET name = ?1 WHERE record_id = ?2",
                    params![value, record_id],
                )?,
            };
        }

        let meta_response = QuestionResponse::new(survey_instance_id, meta.question_id(), value)
            .with_type(meta.type_tag())
            .with_iteration(NOT_REPEATED);
        let saved = upsert_response(&tx, &meta_response)?;
        tx.commit()?;
        Ok(Some(saved))
    }
}

impl RecordRepository for SurveyStore {
    fn create_record(&self, survey_group_id: i64) -> Result<String> {
        let record_id = Uuid::new_v4().to_string();
        self.db.conn()?.execute(
            "INSERT INTO records (record_id, survey_group_id, last_modified) VALUES (?1, ?2, ?3)",
            params![record_id, survey_group_id, now_millis()],
        )?;
        Ok(record_id)
    }

    fn get_record(&self, record_id: &str) -> Result<Option<Record>> {
        self.db
            .conn()?
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM records WHERE record_id = ?1"),
                params![record_id],
                Self::row_to_record,
            )
            .optional()
            .map_err(Into::into)
    }

    fn records_for_group(&self, survey_group_id: i64) -> Result<Vec<Record>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM records
             WHERE survey_group_id = ?1 ORDER BY last_modified DESC"
        ))?;
        let records = stmt
            .query_map(params![survey_group_id], Self::row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn data_points(
        &self,
        survey_group_id: i64,
        order: DataPointOrder,
        origin: Option<GeoPoint>,
        filter: Option<&str>,
    ) -> Result<Vec<Record>> {
        let pattern = filter
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(|f| format!("%{}%", escape_like(f)));
        let order_by = match order {
            DataPointOrder::Name => "name IS NULL, name COLLATE NOCASE, last_modified DESC",
            DataPointOrder::Date | DataPointOrder::Distance => "last_modified DESC",
        };

        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM records
             WHERE survey_group_id = ?1 AND (?2 IS NULL OR name LIKE ?2 ESCAPE '\\')
             ORDER BY {order_by}"
        ))?;
        let mut records = stmt
            .query_map(params![survey_group_id, pattern], Self::row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        if let (DataPointOrder::Distance, Some(origin)) = (order, origin) {
            // Stable sort keeps date order among equals and unlocated points.
            records.sort_by(|a, b| {
                let distance = |r: &Record| r.location().map(|p| origin.distance_to(&p));
                match (distance(a), distance(b)) {
                    (Some(x), Some(y)) => x.total_cmp(&y),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                }
            });
        }
        debug!(survey_group_id, ?order, count = records.len(), "listed data points");
        Ok(records)
    }

    fn update_record_modified_date(&self, record_id: &str, timestamp: i64) -> Result<()> {
        self.db.conn()?.execute(
            "UPDATE records SET last_modified = ?1 WHERE record_id = ?2",
            params![timestamp, record_id],
        )?;
        Ok(())
    }

    fn clear_record_name(&self, survey_instance_id: i64) -> Result<()> {
        self.db.conn()?.execute(
            "UPDATE records SET name = NULL
             WHERE record_id = (SELECT record_id FROM survey_instances WHERE id = ?1)",
            params![survey_instance_id],
        )?;
        Ok(())
    }

    fn delete_empty_records(&self) -> Result<usize> {
        let deleted = self.db.conn()?.execute(
            "DELETE FROM records WHERE record_id NOT IN
                (SELECT DISTINCT record_id FROM survey_instances WHERE record_id IS NOT NULL)",
            [],
        )?;
        Ok(deleted)
    }
}

impl UserRepository for SurveyStore {
    fn create_or_update_user(&self, id: Option<i64>, name: &str) -> Result<i64> {
        let conn = self.db.conn()?;
        if let Some(id) = id {
            let updated = conn.execute(
                "UPDATE users SET name = ?1 WHERE id = ?2",
                params![name, id],
            )?;
            if updated > 0 {
                return Ok(id);
            }
        }
        conn.execute("INSERT INTO users (name) VALUES (?1)", params![name])?;
        Ok(conn.last_insert_rowid())
    }

    fn get_user(&self, id: i64) -> Result<Option<User>> {
        self.db
            .conn()?
            .query_row(
                "SELECT id, name, email, deleted FROM users WHERE id = ?1",
                params![id],
                Self::row_to_user,
            )
            .optional()
            .map_err(Into::into)
    }

    fn list_users(&self) -> Result<Vec<User>> {
        let conn = self.db.conn()?;
        let mut stmt =
            conn.prepare("SELECT id, name, email, deleted FROM users WHERE deleted = 0 ORDER BY name")?;
        let users = stmt
            .query_map([], Self::row_to_user)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(users)
    }

    fn delete_user(&self, id: i64) -> Result<()> {
        self.db
            .conn()?
            .execute("UPDATE users SET deleted = 1 WHERE id = ?1", params![id])?;
        Ok(())
    }
}

impl SettingsRepository for SurveyStore {
    fn get_settings(&self) -> Result<DeviceSettings> {
        let settings = self
            .db
            .conn()?
            .query_row(
                "SELECT server_base_url, device_identifier, app_language, mobile_sync_enabled, keep_screen_on, image_size
                 FROM settings WHERE id = 1",
                [],
                |row| {
                    Ok(DeviceSettings {
                        server_base_url: row.get(0)?,
                        device_identifier: row.get(1)?,
                        app_language: row.get(2)?,
                        mobile_sync_enabled: row.get(3)?,
                        keep_screen_on: row.get(4)?,
                        image_size: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(settings.unwrap_or_default())
    }

    fn save_settings(&self, settings: &DeviceSettings) -> Result<()> {
        self.db.conn()?.execute(
            "INSERT INTO settings (id, server_base_url, device_identifier, app_language, mobile_sync_enabled, keep_screen_on, image_size)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (id) DO UPDATE SET
                server_base_url = excluded.server_base_url,
                device_identifier = excluded.device_identifier,
                app_language = excluded.app_language,
                mobile_sync_enabled = excluded.mobile_sync_enabled,
                keep_screen_on = excluded.keep_screen_on,
                image_size = excluded.image_size",
            params![
                settings.server_base_url,
                settings.device_identifier,
                settings.app_language,
                settings.mobile_sync_enabled,
                settings.keep_screen_on,
                settings.image_size
            ],
        )?;
        Ok(())
    }

    fn save_languages(&self, survey_group_id: i64, codes: &[String]) -> Result<()> {
        let mut conn = self.db.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM languages WHERE survey_group_id = ?1",
            params![survey_group_id],
        )?;
        for code in codes {
            tx.execute(
                "INSERT OR IGNORE INTO languages (survey_group_id, language_code) VALUES (?1, ?2)",
                params![survey_group_id, code],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn languages(&self, survey_group_id: i64) -> Result<Vec<Language>> {
        let conn = self.db.conn()?;
        let mut stmt = conn.prepare(
            "SELECT survey_group_id, language_code FROM languages
             WHERE survey_group_id = ?1 ORDER BY id",
        )?;
        let languages = stmt
            .query_map(params![survey_group_id], |row| {
                Ok(Language {
                    survey_group_id: row.get(0)?,
                    code: row.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(languages)
    }
}

impl SyncRepository for SurveyStore {
    fn synced_time(&self, survey_group_id: i64) -> Result<Option<SyncedTime>> {
        let raw: Option<Option<String>> = self
            .db
            .conn()?
            .query_row(
                "SELECT time FROM sync_time WHERE survey_group_id = ?1",
                params![survey_group_id],
                |row| row.get(0),
            )
            .optional()?;

        match raw.flatten() {
            Some(time) => {
                let time = time.trim().parse::<i64>().map_err(|_| {
                    DbError::InvalidData(format!("sync time {time:?} for group {survey_group_id}"))
                })?;
                Ok(Some(SyncedTime {
                    survey_group_id,
                    time,
                }))
            }
            None => Ok(None),
        }
    }

    /// Merge records and downloaded instances, then advance the group's
    /// synced time, all in one transaction.
    fn merge_remote_batch(&self, batch: &RemoteBatch) -> Result<MergeStats> {
        let mut conn = self.db.conn()?;
        let tx = conn.transaction()?;
        let mut stats = MergeStats::default();

        for record in &batch.records {
            tx.execute(
                "INSERT INTO records (record_id, survey_group_id, name, latitude, longitude, last_modified)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (record_id) DO UPDATE SET
                    survey_group_id = excluded.survey_group_id,
                    name = excluded.name,
                    latitude = excluded.latitude,
                    longitude = excluded.longitude,
                    last_modified = excluded.last_modified",
                params![
                    record.record_id,
                    record.survey_group_id,
                    record.name,
                    record.latitude,
                    record.longitude,
                    record.last_modified
                ],
            )?;
            stats.records_merged += 1;
        }

        for instance in &batch.instances {
            tx.execute(
                "INSERT INTO survey_instances (uuid, survey_id, record_id, submitter, submitted_date, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (uuid) DO UPDATE SET
                    survey_id = excluded.survey_id,
                    record_id = excluded.record_id,
                    submitter = excluded.submitter,
                    submitted_date = excluded.submitted_date,
                    status = excluded.status",
                params![
                    instance.uuid,
                    instance.survey_id,
                    instance.record_id,
                    instance.submitter,
                    instance.submitted_date,
                    SurveyInstanceStatus::Downloaded.code()
                ],
            )?;
            let instance_id: i64 = tx.query_row(
                "SELECT id FROM survey_instances WHERE uuid = ?1",
                params![instance.uuid],
                |row| row.get(0),
            )?;
            for response in &instance.responses {
                upsert_response(&tx, &response.for_instance(instance_id))?;
                stats.responses_merged += 1;
            }
            stats.instances_merged += 1;
        }

        if let Some(latest) = batch.latest_modified {
            tx.execute(
                "INSERT INTO sync_time (survey_group_id, time) VALUES (?1, ?2)
                 ON CONFLICT (survey_group_id) DO UPDATE SET time = excluded.time",
                params![batch.survey_group_id, latest.to_string()],
            )?;
            stats.synced_time = Some(latest);
        }

        tx.commit()?;
        info!(
            survey_group_id = batch.survey_group_id,
            records = stats.records_merged,
            instances = stats.instances_merged,
            "remote batch merged"
        );
        Ok(stats)
    }
}
