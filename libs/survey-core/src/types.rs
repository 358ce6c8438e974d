//! Core types for survey data collection.

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::geo::GeoPoint;

/// Family of survey forms sharing a registration form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurveyGroup {
    pub id: i64,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub register_survey_id: Option<String>,
    pub monitored: bool,
}

impl SurveyGroup {
    /// Group id used for surveys that do not belong to any group.
    pub const ID_NONE: i64 = -1;

    /// Registration form id, ignoring blank and literal `"null"` values
    /// that older servers send for non-monitored groups.
    pub fn registration_form_id(&self) -> Option<&str> {
        self.register_survey_id
            .as_deref()
            .filter(|id| !id.is_empty() && !id.eq_ignore_ascii_case("null"))
    }
}

/// Survey form definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Survey {
    pub id: String,
    pub group_id: i64,
    pub version: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub survey_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_language: Option<String>,
    pub help_downloaded: bool,
    pub deleted: bool,
}

impl Survey {
    /// Create a survey with only the identifying fields set.
    pub fn new(id: impl Into<String>, group_id: i64, version: f64, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            group_id,
            version,
            survey_type: None,
            location: None,
            filename: None,
            name: name.into(),
            default_language: None,
            help_downloaded: false,
            deleted: false,
        }
    }
}

/// Lifecycle of a survey instance.
///
/// Transitions are driven by the submission pipeline; the store only persists them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurveyInstanceStatus {
    Saved,
    SubmitRequested,
    Submitted,
    Exported,
    Synced,
    Downloaded,
}

impl Default for SurveyInstanceStatus {
    fn default() -> Self {
        Self::Saved
    }
}

impl SurveyInstanceStatus {
    /// Persisted integer code.
    pub fn code(self) -> i32 {
        match self {
            Self::Saved => 0,
            Self::SubmitRequested => 1,
            Self::Submitted => 2,
            Self::Exported => 3,
            Self::Synced => 4,
            Self::Downloaded => 5,
        }
    }

    /// Parse from persisted integer code.
    pub fn from_code(code: i32) -> Result<Self, ValidationError> {
        match code {
            0 => Ok(Self::Saved),
            1 => Ok(Self::SubmitRequested),
            2 => Ok(Self::Submitted),
            3 => Ok(Self::Exported),
            4 => Ok(Self::Synced),
            5 => Ok(Self::Downloaded),
            _ => Err(ValidationError::UnknownStatus {
                kind: "survey instance",
                code,
            }),
        }
    }
}

/// One filled-in run of a survey.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurveyInstance {
    pub id: i64,
    pub uuid: String,
    pub survey_id: String,
    pub user_id: Option<i64>,
    pub start_date: Option<i64>,
    pub saved_date: Option<i64>,
    pub submitted_date: Option<i64>,
    pub record_id: Option<String>,
    pub status: SurveyInstanceStatus,
    pub exported_date: Option<i64>,
    pub sync_date: Option<i64>,
    pub duration: i64,
    pub submitter: Option<String>,
    pub version: Option<f64>,
}

/// A monitored real-world entity tracked across survey visits ("data point").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub record_id: String,
    pub survey_group_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    pub last_modified: i64,
}

impl Record {
    /// Location, when both coordinates are known.
    pub fn location(&self) -> Option<GeoPoint> {
        Some(GeoPoint::new(self.latitude?, self.longitude?))
    }
}

/// Upload state of a single file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransmissionStatus {
    Queued,
    InProgress,
    Synced,
    Failed,
}

impl TransmissionStatus {
    /// Persisted integer code.
    pub fn code(self) -> i32 {
        match self {
            Self::Queued => 0,
            Self::InProgress => 1,
            Self::Synced => 2,
            Self::Failed => 3,
        }
    }

    /// Parse from persisted integer code.
    pub fn from_code(code: i32) -> Result<Self, ValidationError> {
        match code {
            0 => Ok(Self::Queued),
            1 => Ok(Self::InProgress),
            2 => Ok(Self::Synced),
            3 => Ok(Self::Failed),
            _ => Err(ValidationError::UnknownStatus {
                kind: "transmission",
                code,
            }),
        }
    }

    /// Statuses the upload subsystem has to retry.
    ///
    /// `InProgress` is included because an upload interrupted by a process
    /// restart cannot resume its previous session.
    pub fn unsynced() -> [Self; 3] {
        [Self::Failed, Self::InProgress, Self::Queued]
    }
}

/// Upload ledger entry for one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileTransmission {
    pub id: i64,
    /// Owning survey instance, absent when a failure was recorded for an unknown file.
    pub survey_instance_id: Option<i64>,
    pub form_id: Option<String>,
    pub filename: String,
    pub status: TransmissionStatus,
    pub start_date: Option<i64>,
    pub end_date: Option<i64>,
}

/// Incremental pull-sync high-water mark for a survey group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncedTime {
    pub survey_group_id: i64,
    pub time: i64,
}

/// Device user (enumerator).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub deleted: bool,
}

/// Language enabled for a survey group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Language {
    pub survey_group_id: i64,
    pub code: String,
}

/// Device-level settings persisted alongside the survey data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// User override of the server base URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_identifier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_language: Option<String>,
    pub mobile_sync_enabled: bool,
    pub keep_screen_on: bool,
    pub image_size: i32,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            server_base_url: None,
            device_identifier: None,
            app_language: None,
            mobile_sync_enabled: false,
            keep_screen_on: true,
            image_size: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_status_codes_round_trip() {
        for status in [
            SurveyInstanceStatus::Saved,
            SurveyInstanceStatus::SubmitRequested,
            SurveyInstanceStatus::Submitted,
            SurveyInstanceStatus::Exported,
            SurveyInstanceStatus::Synced,
            SurveyInstanceStatus::Downloaded,
        ] {
            assert_eq!(SurveyInstanceStatus::from_code(status.code()).unwrap(), status);
        }
    }

    #[test]
    fn unknown_transmission_code_is_rejected() {
        let err = TransmissionStatus::from_code(9).unwrap_err();
        assert_eq!(
            err,
            ValidationError::UnknownStatus {
                kind: "transmission",
                code: 9
            }
        );
    }

    #[test]
    fn unsynced_excludes_synced() {
        assert!(!TransmissionStatus::unsynced().contains(&TransmissionStatus::Synced));
        assert_eq!(TransmissionStatus::unsynced().len(), 3);
    }

    #[test]
    fn registration_form_id_ignores_null_literal() {
        let mut group = SurveyGroup {
            id: 1,
            name: "Water points".to_string(),
            register_survey_id: Some("NULL".to_string()),
            monitored: true,
        };
        assert_eq!(group.registration_form_id(), None);

        group.register_survey_id = Some("1001".to_string());
        assert_eq!(group.registration_form_id(), Some("1001"));
    }
}
