//! SQLite schema definitions.

/// Schema version of the first release with an upgradable store.
pub const VER_LAUNCH: i32 = 78;
pub const VER_FORM_SUBMITTER: i32 = 79;
pub const VER_FORM_DEL_CHECK: i32 = 80;
pub const VER_FORM_VERSION: i32 = 81;
pub const VER_CADDISFLY_QN: i32 = 82;
pub const VER_PREFERENCES_MIGRATE: i32 = 83;
pub const VER_LANGUAGES_MIGRATE: i32 = 84;
pub const VER_RESPONSE_ITERATION: i32 = 85;

/// Current schema version for migrations.
pub const SCHEMA_VERSION: i32 = VER_RESPONSE_ITERATION;

pub const CREATE_USERS: &str = r#"
CREATE TABLE users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    email TEXT,
    deleted INTEGER NOT NULL DEFAULT 0
)"#;

pub const CREATE_SURVEYS: &str = r#"
CREATE TABLE surveys (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    survey_id TEXT NOT NULL,
    survey_group_id INTEGER,
    name TEXT NOT NULL,
    version REAL,
    type TEXT,
    location TEXT,
    filename TEXT,
    language TEXT,
    help_downloaded INTEGER NOT NULL DEFAULT 0,
    deleted INTEGER NOT NULL DEFAULT 0,
    UNIQUE (survey_id)
)"#;

pub const CREATE_SURVEY_GROUPS: &str = r#"
CREATE TABLE survey_groups (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    survey_group_id INTEGER,
    name TEXT,
    register_survey_id TEXT,
    monitored INTEGER NOT NULL DEFAULT 0,
    UNIQUE (survey_group_id)
)"#;

pub const CREATE_SURVEY_INSTANCES: &str = r#"
CREATE TABLE survey_instances (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    uuid TEXT,
    survey_id TEXT NOT NULL,
    user_id INTEGER,
    start_date INTEGER,
    saved_date INTEGER,
    submitted_date INTEGER,
    record_id TEXT,
    status INTEGER,
    exported_date INTEGER,
    sync_date INTEGER,
    duration INTEGER NOT NULL DEFAULT 0,
    submitter TEXT,
    version REAL,
    UNIQUE (uuid)
)"#;

pub const CREATE_RESPONSES: &str = r#"
CREATE TABLE responses (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    survey_instance_id INTEGER NOT NULL,
    question_id TEXT NOT NULL,
    answer TEXT NOT NULL,
    type TEXT NOT NULL,
    include INTEGER NOT NULL DEFAULT 1,
    filename TEXT,
    iteration INTEGER NOT NULL DEFAULT -1
)"#;

pub const CREATE_RECORDS: &str = r#"
CREATE TABLE records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    record_id TEXT,
    survey_group_id INTEGER,
    name TEXT,
    latitude REAL,
    longitude REAL,
    last_modified INTEGER NOT NULL DEFAULT 0,
    UNIQUE (record_id)
)"#;

pub const CREATE_TRANSMISSIONS: &str = r#"
CREATE TABLE transmissions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    survey_instance_id INTEGER,
    survey_id TEXT,
    filename TEXT,
    status INTEGER,
    start_date INTEGER,
    end_date INTEGER,
    UNIQUE (filename)
)"#;

pub const CREATE_SYNC_TIME: &str = r#"
CREATE TABLE sync_time (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    survey_group_id INTEGER,
    time TEXT,
    UNIQUE (survey_group_id)
)"#;

pub const CREATE_LANGUAGES: &str = r#"
CREATE TABLE IF NOT EXISTS languages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    survey_group_id INTEGER NOT NULL,
    language_code TEXT NOT NULL,
    UNIQUE (survey_group_id, language_code)
)"#;

pub const CREATE_SETTINGS: &str = r#"
CREATE TABLE IF NOT EXISTS settings (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    server_base_url TEXT,
    device_identifier TEXT,
    app_language TEXT,
    mobile_sync_enabled INTEGER NOT NULL DEFAULT 0,
    keep_screen_on INTEGER NOT NULL DEFAULT 1,
    image_size INTEGER NOT NULL DEFAULT 0
)"#;

/// Initialize settings row if not exists.
pub const INIT_SETTINGS: &str = "INSERT OR IGNORE INTO settings (id) VALUES (1)";

pub const CREATE_RESPONSE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS response_idx ON responses (survey_instance_id, question_id)";

/// Every table of the current schema, in creation order.
pub const TABLES: &[&str] = &[
    CREATE_USERS,
    CREATE_SURVEYS,
    CREATE_SURVEY_GROUPS,
    CREATE_SURVEY_INSTANCES,
    CREATE_RESPONSES,
    CREATE_RECORDS,
    CREATE_TRANSMISSIONS,
    CREATE_SYNC_TIME,
    CREATE_LANGUAGES,
    CREATE_SETTINGS,
];

/// Indexes of the current schema.
pub const INDEXES: &[&str] = &[
    CREATE_RESPONSE_INDEX,
    "CREATE INDEX IF NOT EXISTS record_name_idx ON records (name)",
    "CREATE INDEX IF NOT EXISTS instance_status_idx ON survey_instances (status)",
    "CREATE INDEX IF NOT EXISTS instance_submitted_idx ON survey_instances (submitted_date)",
];

/// Tables dropped when an unsupported legacy store is reset.
pub const ALL_TABLES: &[&str] = &[
    "responses",
    "sync_time",
    "surveys",
    "preferences",
    "users",
    "survey_groups",
    "survey_instances",
    "records",
    "transmissions",
    "languages",
    "settings",
];

/// Schema shipped at [`VER_LAUNCH`], the oldest store the chain upgrades.
pub const LEGACY_LAUNCH_SCHEMA: &str = r#"
CREATE TABLE users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    email TEXT,
    deleted INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE surveys (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    survey_id TEXT NOT NULL,
    survey_group_id INTEGER,
    name TEXT NOT NULL,
    version REAL,
    type TEXT,
    location TEXT,
    filename TEXT,
    language TEXT,
    help_downloaded INTEGER NOT NULL DEFAULT 0,
    deleted INTEGER NOT NULL DEFAULT 0,
    UNIQUE (survey_id) ON CONFLICT REPLACE
);
CREATE TABLE survey_groups (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    survey_group_id INTEGER,
    name TEXT,
    register_survey_id TEXT,
    monitored INTEGER NOT NULL DEFAULT 0,
    UNIQUE (survey_group_id) ON CONFLICT REPLACE
);
CREATE TABLE survey_instances (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    uuid TEXT,
    survey_id TEXT NOT NULL,
    user_id INTEGER,
    start_date INTEGER,
    saved_date INTEGER,
    submitted_date INTEGER,
    record_id TEXT,
    status INTEGER,
    exported_date INTEGER,
    sync_date INTEGER,
    duration INTEGER NOT NULL DEFAULT 0,
    UNIQUE (uuid) ON CONFLICT REPLACE
);
CREATE TABLE responses (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    survey_instance_id INTEGER NOT NULL,
    question_id TEXT NOT NULL,
    answer TEXT NOT NULL,
    type TEXT NOT NULL,
    include INTEGER NOT NULL DEFAULT 1
);
CREATE TABLE records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    record_id TEXT,
    survey_group_id INTEGER,
    name TEXT,
    latitude REAL,
    longitude REAL,
    last_modified INTEGER NOT NULL DEFAULT 0,
    UNIQUE (record_id) ON CONFLICT REPLACE
);
CREATE TABLE transmissions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    survey_instance_id INTEGER NOT NULL,
    filename TEXT,
    status INTEGER,
    start_date INTEGER,
    end_date INTEGER,
    UNIQUE (filename) ON CONFLICT REPLACE
);
CREATE TABLE sync_time (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    survey_group_id INTEGER,
    time TEXT,
    UNIQUE (survey_group_id) ON CONFLICT REPLACE
);
CREATE TABLE preferences (
    key TEXT PRIMARY KEY,
    value TEXT
);
CREATE INDEX response_idx ON responses (survey_instance_id, question_id);
CREATE INDEX record_name_idx ON records (name);
CREATE INDEX instance_status_idx ON survey_instances (status);
CREATE INDEX instance_submitted_idx ON survey_instances (submitted_date);
"#;
