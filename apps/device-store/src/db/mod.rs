//! Local SQLite store for survey data.

pub mod connection;
pub mod date_utils;
pub mod error;
pub mod migration;
pub mod repository;
pub mod schema;
pub mod transmission;

pub use connection::{ConnectionManager, DbHandle};
pub use error::DbError;
pub use repository::{
    DataPointOrder, DownloadedInstance, InstanceRepository, MergeStats, RecordRepository, RemoteBatch,
    ResponseRepository, SettingsRepository, SurveyRepository, SurveyStore, SyncRepository,
    UserRepository,
};
pub use transmission::TransmissionTracker;
