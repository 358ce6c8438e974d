//! Versioned schema creation and upgrade chain.
//!
//! The on-disk version lives in `PRAGMA user_version`. A brand-new store gets
//! the current schema directly; an older store is walked through every step in
//! `(found, SCHEMA_VERSION]` inside a single transaction, so a failed step
//! leaves nothing behind. Each step also checks the schema before changing it
//! and can be re-run safely.

use std::collections::HashMap;

use rusqlite::{params, Connection, OptionalExtension};
use survey_core::{split_legacy_question_id, SurveyGroup};
use tracing::{debug, info, warn};

use super::error::DbError;
use super::schema::{self, SCHEMA_VERSION, VER_LAUNCH};

type Result<T> = std::result::Result<T, DbError>;

/// One upgrade from `version - 1` to `version`.
struct MigrationStep {
    version: i32,
    description: &'static str,
    apply: fn(&Connection) -> rusqlite::Result<()>,
}

const STEPS: &[MigrationStep] = &[
    MigrationStep {
        version: schema::VER_FORM_SUBMITTER,
        description: "add survey instance submitter",
        apply: add_instance_submitter,
    },
    MigrationStep {
        version: schema::VER_FORM_DEL_CHECK,
        description: "add transmission form id",
        apply: rebuild_transmissions,
    },
    MigrationStep {
        version: schema::VER_FORM_VERSION,
        description: "add survey instance version",
        apply: add_instance_version,
    },
    MigrationStep {
        version: schema::VER_CADDISFLY_QN,
        description: "add response filename",
        apply: add_response_filename,
    },
    MigrationStep {
        version: schema::VER_PREFERENCES_MIGRATE,
        description: "bootstrap settings from preferences",
        apply: bootstrap_settings,
    },
    MigrationStep {
        version: schema::VER_LANGUAGES_MIGRATE,
        description: "migrate languages and drop preferences",
        apply: migrate_languages,
    },
    MigrationStep {
        version: schema::VER_RESPONSE_ITERATION,
        description: "add response iteration",
        apply: rebuild_responses,
    },
    MigrationStep {
        version: schema::VER_RESPONSE_ITERATION,
        description: "drop replace-on-conflict unique constraints",
        apply: drop_replace_conflicts,
    },
];

/// Tables whose launch-era unique constraint silently replaced rows on conflict.
const REPLACING_TABLES: &[(&str, &str)] = &[
    ("surveys", schema::CREATE_SURVEYS),
    ("survey_groups", schema::CREATE_SURVEY_GROUPS),
    ("survey_instances", schema::CREATE_SURVEY_INSTANCES),
    ("records", schema::CREATE_RECORDS),
    ("sync_time", schema::CREATE_SYNC_TIME),
];

/// Legacy preference keys and the settings column each one maps to.
const PREFERENCE_COLUMNS: &[(&str, &str)] = &[
    ("backend.server", "server_base_url"),
    ("device.identifier", "device_identifier"),
    ("app.language", "app_language"),
    ("data.cellular.upload", "mobile_sync_enabled"),
    ("screen.keepon", "keep_screen_on"),
    ("media.size", "image_size"),
];

const LANGUAGE_PREFERENCE_KEY: &str = "survey.language";

/// Read the persisted schema version.
pub fn schema_version(conn: &Connection) -> Result<i32> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

/// Bring the store to [`SCHEMA_VERSION`], creating or upgrading as needed.
pub fn initialize(conn: &mut Connection) -> Result<()> {
    let found = schema_version(conn)?;

    if found == SCHEMA_VERSION {
        debug!(version = found, "schema up to date");
        return Ok(());
    }
    if found > SCHEMA_VERSION {
        return Err(DbError::UnsupportedVersion {
            found,
            supported: SCHEMA_VERSION,
        });
    }
    if found == 0 && !has_tables(conn)? {
        info!(version = SCHEMA_VERSION, "creating schema");
        return create_fresh(conn);
    }
    if found < VER_LAUNCH {
        warn!(found, "store predates the upgrade chain, resetting");
        return reset(conn);
    }

    upgrade(conn, found, SCHEMA_VERSION)
}

/// Apply every step in `(from, to]` atomically and record `to` as the new version.
pub fn upgrade(conn: &mut Connection, from: i32, to: i32) -> Result<()> {
    if to > SCHEMA_VERSION {
        return Err(DbError::UnsupportedVersion {
            found: to,
            supported: SCHEMA_VERSION,
        });
    }
    info!(from, to, "upgrading schema");

    let tx = conn.transaction()?;
    for step in STEPS.iter().filter(|s| s.version > from && s.version <= to) {
        debug!(version = step.version, step = step.description, "applying migration");
        (step.apply)(&tx).map_err(|source| DbError::Migration {
            version: step.version,
            source,
        })?;
    }
    set_version(&tx, to).map_err(|source| DbError::Migration {
        version: to,
        source,
    })?;
    tx.commit().map_err(|source| DbError::Migration {
        version: to,
        source,
    })?;
    Ok(())
}

fn create_fresh(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;
    create_schema(&tx)?;
    set_version(&tx, SCHEMA_VERSION)?;
    tx.commit()?;
    Ok(())
}

fn reset(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;
    for table in schema::ALL_TABLES {
        tx.execute_batch(&format!("DROP TABLE IF EXISTS {table}"))?;
    }
    create_schema(&tx)?;
    set_version(&tx, SCHEMA_VERSION)?;
    tx.commit()?;
    Ok(())
}

fn create_schema(conn: &Connection) -> rusqlite::Result<()> {
    for ddl in schema::TABLES.iter().chain(schema::INDEXES) {
        conn.execute_batch(ddl)?;
    }
    conn.execute_batch(schema::INIT_SETTINGS)
}

fn set_version(conn: &Connection, version: i32) -> rusqlite::Result<()> {
    conn.execute_batch(&format!("PRAGMA user_version = {version}"))
}

fn has_tables(conn: &Connection) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
        [],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![table],
        |row| row.get::<_, i64>(0),
    )
    .map(|count| count > 0)
}

/// Column metadata from `PRAGMA table_info`: (notnull, default).
fn column_info(
    conn: &Connection,
    table: &str,
    column: &str,
) -> rusqlite::Result<Option<(bool, Option<String>)>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(Some((row.get(3)?, row.get(4)?)));
        }
    }
    Ok(None)
}

fn column_names(conn: &Connection, table: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let rows = stmt.query_map([], |row| row.get(1))?;
    rows.collect()
}

fn add_column(conn: &Connection, table: &str, column: &str, decl: &str) -> rusqlite::Result<()> {
    if column_info(conn, table, column)?.is_some() {
        return Ok(());
    }
    conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"))
}

fn add_instance_submitter(conn: &Connection) -> rusqlite::Result<()> {
    add_column(conn, "survey_instances", "submitter", "TEXT")
}

fn add_instance_version(conn: &Connection) -> rusqlite::Result<()> {
    add_column(conn, "survey_instances", "version", "REAL")
}

fn add_response_filename(conn: &Connection) -> rusqlite::Result<()> {
    add_column(conn, "responses", "filename", "TEXT")
}

/// Adds the form id and makes the owning instance optional; `-1` owners become NULL.
fn rebuild_transmissions(conn: &Connection) -> rusqlite::Result<()> {
    let has_form_id = column_info(conn, "transmissions", "survey_id")?.is_some();
    let owner_required = column_info(conn, "transmissions", "survey_instance_id")?
        .map(|(not_null, _)| not_null)
        .unwrap_or(false);
    if has_form_id && !owner_required {
        return Ok(());
    }

    let form_id = if has_form_id { "survey_id" } else { "NULL" };
    conn.execute_batch("ALTER TABLE transmissions RENAME TO transmissions_legacy")?;
    conn.execute_batch(schema::CREATE_TRANSMISSIONS)?;
    conn.execute_batch(&format!(
        "INSERT INTO transmissions (id, survey_instance_id, survey_id, filename, status, start_date, end_date)
         SELECT id, NULLIF(survey_instance_id, -1), {form_id}, filename, status, start_date, end_date
         FROM transmissions_legacy"
    ))?;
    conn.execute_batch("DROP TABLE transmissions_legacy")
}

fn read_preferences(conn: &Connection) -> rusqlite::Result<HashMap<String, String>> {
    if !table_exists(conn, "preferences")? {
        return Ok(HashMap::new());
    }
    let mut stmt = conn.prepare("SELECT key, value FROM preferences WHERE value IS NOT NULL")?;
    let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
    rows.collect()
}

fn preference_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}

/// Moves known key-value preferences into the single-row `settings` table.
///
/// The `preferences` table is left in place; the language step still reads it.
fn bootstrap_settings(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(schema::CREATE_SETTINGS)?;
    conn.execute_batch(schema::INIT_SETTINGS)?;

    let preferences = read_preferences(conn)?;
    for (key, column) in PREFERENCE_COLUMNS {
        let Some(value) = preferences.get(*key) else {
            continue;
        };
        let sql = format!("UPDATE settings SET {column} = ?1 WHERE id = 1");
        match *column {
            "mobile_sync_enabled" | "keep_screen_on" => {
                conn.execute(&sql, params![preference_flag(value)])?;
            }
            "image_size" => {
                if let Ok(size) = value.trim().parse::<i32>() {
                    conn.execute(&sql, params![size])?;
                }
            }
            _ => {
                conn.execute(&sql, params![value])?;
            }
        }
    }
    Ok(())
}

/// Copies the legacy survey language list onto every known survey group.
fn migrate_languages(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(schema::CREATE_LANGUAGES)?;

    let preferences = read_preferences(conn)?;
    if let Some(value) = preferences.get(LANGUAGE_PREFERENCE_KEY) {
        let codes: Vec<&str> = value
            .split(',')
            .map(str::trim)
            .filter(|code| !code.is_empty())
            .collect();

        let mut group_ids: Vec<i64> = {
            let mut stmt = conn.prepare(
                "SELECT survey_group_id FROM survey_groups WHERE survey_group_id IS NOT NULL",
            )?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        if group_ids.is_empty() {
            group_ids.push(SurveyGroup::ID_NONE);
        }

        for group_id in &group_ids {
            for code in &codes {
                conn.execute(
                    "INSERT OR IGNORE INTO languages (survey_group_id, language_code) VALUES (?1, ?2)",
                    params![group_id, code],
                )?;
            }
        }
    }

    conn.execute_batch("DROP TABLE IF EXISTS preferences")
}

/// Adds the iteration column and splits legacy `"<questionId>|<iteration>"` ids.
///
/// The table is rebuilt rather than altered so the column default matches a fresh install.
fn rebuild_responses(conn: &Connection) -> rusqlite::Result<()> {
    if let Some((_, default)) = column_info(conn, "responses", "iteration")? {
        if default.as_deref() == Some("-1") {
            return Ok(());
        }
    }
    add_column(conn, "responses", "filename", "TEXT")?;

    conn.execute_batch("ALTER TABLE responses RENAME TO responses_legacy")?;
    conn.execute_batch(schema::CREATE_RESPONSES)?;

    let legacy: Vec<(i64, i64, String, String, String, i64, Option<String>)> = {
        let mut stmt = conn.prepare(
            "SELECT id, survey_instance_id, question_id, answer, type, include, filename
             FROM responses_legacy",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
                row.get(6)?,
            ))
        })?;
        rows.collect::<rusqlite::Result<_>>()?
    };

    {
        let mut insert = conn.prepare(
            "INSERT INTO responses (id, survey_instance_id, question_id, answer, type, include, filename, iteration)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;
        for (id, instance_id, raw_question_id, answer, response_type, include, filename) in legacy {
            let (question_id, iteration) = split_legacy_question_id(&raw_question_id);
            insert.execute(params![
                id,
                instance_id,
                question_id,
                answer,
                response_type,
                include,
                filename,
                iteration
            ])?;
        }
    }

    conn.execute_batch("DROP TABLE responses_legacy")?;
    conn.execute_batch(schema::CREATE_RESPONSE_INDEX)
}

/// Whether the table's stored DDL still carries `ON CONFLICT REPLACE`.
fn replaces_on_conflict(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    let sql: Option<String> = conn
        .query_row(
            "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |row| row.get(0),
        )
        .optional()?;
    Ok(sql.is_some_and(|sql| {
        sql.split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_ascii_uppercase()
            .contains("ON CONFLICT REPLACE")
    }))
}

/// Rebuilds launch-era tables with plain unique constraints, so a duplicate
/// insert fails instead of deleting the existing row.
fn drop_replace_conflicts(conn: &Connection) -> rusqlite::Result<()> {
    for (table, ddl) in REPLACING_TABLES {
        if !replaces_on_conflict(conn, table)? {
            continue;
        }
        let legacy = format!("{table}_legacy");
        conn.execute_batch(&format!("ALTER TABLE {table} RENAME TO {legacy}"))?;
        conn.execute_batch(ddl)?;

        let old_columns = column_names(conn, &legacy)?;
        let columns = column_names(conn, table)?
            .into_iter()
            .filter(|column| old_columns.contains(column))
            .collect::<Vec<_>>()
            .join(", ");
        conn.execute_batch(&format!(
            "INSERT INTO {table} ({columns}) SELECT {columns} FROM {legacy}"
        ))?;
        // Indexes follow the renamed table and go with it.
        conn.execute_batch(&format!("DROP TABLE {legacy}"))?;
    }
    for ddl in schema::INDEXES {
        conn.execute_batch(ddl)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn settings_row(conn: &Connection) -> rusqlite::Result<Option<(Option<String>, bool, i32)>> {
        conn.query_row(
            "SELECT server_base_url, mobile_sync_enabled, image_size FROM settings WHERE id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()
    }

    fn legacy_store() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(schema::LEGACY_LAUNCH_SCHEMA).unwrap();
        set_version(&conn, VER_LAUNCH).unwrap();
        conn
    }

    #[test]
    fn fresh_store_gets_current_version() {
        let mut conn = Connection::open_in_memory().unwrap();
        initialize(&mut conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), SCHEMA_VERSION);
        assert!(table_exists(&conn, "languages").unwrap());
        assert!(!table_exists(&conn, "preferences").unwrap());
    }

    #[test]
    fn initialize_twice_is_noop() {
        let mut conn = Connection::open_in_memory().unwrap();
        initialize(&mut conn).unwrap();
        initialize(&mut conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn newer_store_is_rejected() {
        let mut conn = Connection::open_in_memory().unwrap();
        set_version(&conn, SCHEMA_VERSION + 1).unwrap();
        let err = initialize(&mut conn).unwrap_err();
        assert!(matches!(err, DbError::UnsupportedVersion { .. }));
    }

    #[test]
    fn pre_launch_store_is_reset() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE responses (id INTEGER PRIMARY KEY, junk TEXT);")
            .unwrap();
        set_version(&conn, 40).unwrap();

        initialize(&mut conn).unwrap();

        assert_eq!(schema_version(&conn).unwrap(), SCHEMA_VERSION);
        assert_eq!(column_info(&conn, "responses", "junk").unwrap(), None);
        assert!(column_info(&conn, "responses", "iteration").unwrap().is_some());
    }

    #[test]
    fn preferences_become_settings_and_languages() {
        let mut conn = legacy_store();
        conn.execute_batch(
            "INSERT INTO preferences (key, value) VALUES
                ('backend.server', 'https://flow.example.org'),
                ('data.cellular.upload', 'true'),
                ('media.size', '2'),
                ('survey.language', 'en, fr,,es');
             INSERT INTO survey_groups (survey_group_id, name) VALUES (10, 'Wells'), (11, 'Schools');",
        )
        .unwrap();

        initialize(&mut conn).unwrap();

        assert_eq!(
            settings_row(&conn).unwrap(),
            Some((Some("https://flow.example.org".to_string()), true, 2))
        );
        let languages: i64 = conn
            .query_row("SELECT COUNT(*) FROM languages", [], |row| row.get(0))
            .unwrap();
        assert_eq!(languages, 6);
        assert!(!table_exists(&conn, "preferences").unwrap());
    }

    #[test]
    fn legacy_responses_get_iterations() {
        let mut conn = legacy_store();
        conn.execute_batch(
            "INSERT INTO responses (id, survey_instance_id, question_id, answer, type) VALUES
                (1, 5, '100', 'plain', 'VALUE'),
                (2, 5, '200|0', 'first', 'VALUE'),
                (3, 5, '200|1', 'second', 'VALUE');",
        )
        .unwrap();

        initialize(&mut conn).unwrap();

        let mut stmt = conn
            .prepare("SELECT id, question_id, iteration FROM responses ORDER BY id")
            .unwrap();
        let rows: Vec<(i64, String, i32)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert_eq!(
            rows,
            vec![
                (1, "100".to_string(), -1),
                (2, "200".to_string(), 0),
                (3, "200".to_string(), 1),
            ]
        );
    }

    #[test]
    fn sentinel_transmission_owner_becomes_null() {
        let mut conn = legacy_store();
        conn.execute_batch(
            "INSERT INTO transmissions (survey_instance_id, filename, status) VALUES (-1, 'a.jpg', 3), (4, 'b.jpg', 0);",
        )
        .unwrap();

        initialize(&mut conn).unwrap();

        let owner: Option<i64> = conn
            .query_row(
                "SELECT survey_instance_id FROM transmissions WHERE filename = 'a.jpg'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(owner, None);
        let owner: Option<i64> = conn
            .query_row(
                "SELECT survey_instance_id FROM transmissions WHERE filename = 'b.jpg'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(owner, Some(4));
    }

    #[test]
    fn steps_are_safe_to_rerun() {
        let conn = legacy_store();
        for step in STEPS {
            (step.apply)(&conn).unwrap();
        }
        for step in STEPS {
            (step.apply)(&conn).unwrap();
        }
        assert_eq!(
            column_info(&conn, "responses", "iteration").unwrap(),
            Some((true, Some("-1".to_string())))
        );
    }

    #[test]
    fn failed_step_rolls_back_whole_upgrade() {
        let mut conn = legacy_store();
        // A table squatting on the rebuild's scratch name makes step 80 fail.
        conn.execute_batch("CREATE TABLE transmissions_legacy (id INTEGER);")
            .unwrap();

        let err = initialize(&mut conn).unwrap_err();

        assert!(matches!(err, DbError::Migration { version: 80, .. }));
        assert_eq!(schema_version(&conn).unwrap(), VER_LAUNCH);
        assert_eq!(column_info(&conn, "survey_instances", "submitter").unwrap(), None);
    }

    #[test]
    fn upgraded_uniques_reject_duplicates() {
        let mut conn = legacy_store();
        conn.execute_batch(
            "INSERT INTO records (record_id, name) VALUES ('r-1', 'Well 1');
             INSERT INTO survey_instances (uuid, survey_id, status) VALUES ('u-1', 's-1', 1);",
        )
        .unwrap();

        initialize(&mut conn).unwrap();

        for (table, _) in REPLACING_TABLES {
            assert!(!replaces_on_conflict(&conn, table).unwrap(), "{table}");
        }
        assert!(conn
            .execute("INSERT INTO records (record_id, name) VALUES ('r-1', 'other')", [])
            .is_err());
        assert!(conn
            .execute(
                "INSERT INTO survey_instances (uuid, survey_id) VALUES ('u-1', 's-2')",
                []
            )
            .is_err());

        let (id, name): (i64, String) = conn
            .query_row("SELECT id, name FROM records WHERE record_id = 'r-1'", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert_eq!((id, name.as_str()), (1, "Well 1"));
        let indexes: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name IN
                    ('record_name_idx', 'instance_status_idx', 'instance_submitted_idx')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(indexes, 3);
    }
}
