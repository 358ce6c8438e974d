//! Remote data point source.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use survey_core::{QuestionResponse, Record, NOT_REPEATED};

use crate::db::DownloadedInstance;

use super::SyncError;

/// Header carrying the device API key.
pub const API_KEY_HEADER: &str = "X-Api-Key";

/// Data point as served by the remote authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteDataPoint {
    pub record_id: String,
    pub survey_group_id: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    pub last_modified: i64,
    #[serde(default)]
    pub survey_instances: Vec<RemoteSurveyInstance>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteSurveyInstance {
    pub uuid: String,
    pub survey_id: String,
    #[serde(default)]
    pub submitter: Option<String>,
    #[serde(default)]
    pub submitted_date: Option<i64>,
    #[serde(default)]
    pub responses: Vec<RemoteResponse>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteResponse {
    pub question_id: String,
    pub value: String,
    #[serde(default, rename = "type")]
    pub response_type: Option<String>,
    #[serde(default)]
    pub iteration: Option<i32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DataPointsResponse {
    #[serde(default)]
    data_points: Vec<RemoteDataPoint>,
}

impl RemoteDataPoint {
    pub fn to_record(&self) -> Record {
        Record {
            record_id: self.record_id.clone(),
            survey_group_id: self.survey_group_id,
            name: self.name.clone(),
            latitude: self.latitude,
            longitude: self.longitude,
            last_modified: self.last_modified,
        }
    }

    /// Downloaded instances, with responses not yet bound to a local instance id.
    pub fn to_instances(&self) -> Vec<DownloadedInstance> {
        self.survey_instances
            .iter()
            .map(|instance| DownloadedInstance {
                uuid: instance.uuid.clone(),
                survey_id: instance.survey_id.clone(),
                record_id: self.record_id.clone(),
                submitter: instance.submitter.clone(),
                submitted_date: instance.submitted_date,
                responses: instance
                    .responses
                    .iter()
                    .map(|r| {
                        let response = QuestionResponse::new(0, &r.question_id, &r.value)
                            .with_iteration(r.iteration.unwrap_or(NOT_REPEATED));
                        match &r.response_type {
                            Some(t) => response.with_type(t),
                            None => response,
                        }
                    })
                    .collect(),
            })
            .collect()
    }
}

/// Collaborator that fetches data points changed since a timestamp.
///
/// Timeouts are the implementation's concern.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    async fn fetch_data_points(
        &self,
        base_url: &str,
        api_key: &str,
        survey_group_id: i64,
        since: Option<i64>,
    ) -> Result<Vec<RemoteDataPoint>, SyncError>;
}

/// [`RemoteSource`] over HTTP.
#[derive(Clone, Default)]
pub struct HttpRemoteSource {
    client: Client,
}

impl HttpRemoteSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RemoteSource for HttpRemoteSource {
    async fn fetch_data_points(
        &self,
        base_url: &str,
        api_key: &str,
        survey_group_id: i64,
        since: Option<i64>,
    ) -> Result<Vec<RemoteDataPoint>, SyncError> {
        let url = format!("{}/datapoints", base_url.trim_end_matches('/'));
        let since = since.map(|t| t.to_string()).unwrap_or_default();

        let resp = self
            .client
            .get(&url)
            .header(API_KEY_HEADER, api_key)
            .query(&[
                ("surveyGroupId", survey_group_id.to_string()),
                ("since", since),
            ])
            .send()
            .await
            .map_err(|e| SyncError::Network(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let message = resp.text().await.unwrap_or_default();
            return Err(SyncError::Backend { status, message });
        }

        let body: DataPointsResponse = resp
            .json()
            .await
            .map_err(|e| SyncError::Parse(e.to_string()))?;
        Ok(body.data_points)
    }
}
