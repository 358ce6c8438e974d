//! Core survey data library shared by the device store and its sync layer.
//!
//! Provides:
//! - Entity types (SurveyGroup, Survey, SurveyInstance, Record, ...)
//! - Status enumerations with their persisted codes
//! - Response identity keys and repeatable-group handling
//! - Registration metadata and geolocation parsing

pub mod error;
pub mod geo;
pub mod response;
pub mod types;

pub use error::ValidationError;
pub use geo::{parse_geolocation, GeoPoint};
pub use response::{
    clone_for_new_instance, split_legacy_question_id, QuestionResponse, RegistrationMeta,
    ResponseKey, DEFAULT_RESPONSE_TYPE, NOT_REPEATED,
};
pub use types::{
    DeviceSettings, FileTransmission, Language, Record, Survey, SurveyGroup, SurveyInstance,
    SurveyInstanceStatus, SyncedTime, TransmissionStatus, User,
};
