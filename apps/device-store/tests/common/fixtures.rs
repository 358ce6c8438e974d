//! Test fixtures and factory functions for creating test data.

use serde_json::{json, Value};

use flow_device_store::db::{
    InstanceRepository, RecordRepository, SurveyRepository, SurveyStore, UserRepository,
};
use survey_core::{Survey, SurveyGroup, User};

/// A monitored group with its registration form and one follow-up form.
pub fn monitored_group(store: &SurveyStore, group_id: i64) -> SurveyGroup {
    let group = SurveyGroup {
        id: group_id,
        name: format!("Group {group_id}"),
        register_survey_id: Some(format!("REG-{group_id}")),
        monitored: true,
    };
    store.add_survey_group(&group).unwrap();
    store
        .save_survey(&Survey::new(format!("REG-{group_id}"), group_id, 1.0, "Registration"))
        .unwrap();
    store
        .save_survey(&Survey::new(format!("VISIT-{group_id}"), group_id, 1.0, "Visit"))
        .unwrap();
    group
}

pub fn enumerator(store: &SurveyStore) -> User {
    let id = store.create_or_update_user(None, "Enumerator").unwrap();
    store.get_user(id).unwrap().unwrap()
}

/// Record plus a registration instance for it. Returns (record id, instance id).
pub fn registered_record(store: &SurveyStore, group: &SurveyGroup) -> (String, i64) {
    let user = enumerator(store);
    let record_id = store.create_record(group.id).unwrap();
    let form_id = group.registration_form_id().unwrap();
    let instance_id = store
        .create_survey_instance(form_id, 1.0, &user, Some(&record_id))
        .unwrap();
    (record_id, instance_id)
}

/// Remote data point payload as the server sends it.
pub fn data_point(record_id: &str, group_id: i64, name: &str, last_modified: i64) -> Value {
    json!({
        "recordId": record_id,
        "surveyGroupId": group_id,
        "name": name,
        "latitude": 1.5,
        "longitude": 36.8,
        "lastModified": last_modified,
    })
}

pub fn data_points_body(points: Vec<Value>) -> Value {
    json!({ "dataPoints": points })
}
