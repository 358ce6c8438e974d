//! Question responses and their identity rules.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Iteration value for responses outside any repeatable group.
pub const NOT_REPEATED: i32 = -1;

/// Response type stored when the caller supplies none.
pub const DEFAULT_RESPONSE_TYPE: &str = "VALUE";

/// Answer to one question of a survey instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionResponse {
    /// Row id, `None` until persisted.
    pub id: Option<i64>,
    pub survey_instance_id: i64,
    pub question_id: String,
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub include: bool,
    pub iteration: i32,
}

impl QuestionResponse {
    /// Create an unsaved, non-repeated response.
    pub fn new(
        survey_instance_id: i64,
        question_id: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            survey_instance_id,
            question_id: question_id.into(),
            value: value.into(),
            response_type: None,
            filename: None,
            include: true,
            iteration: NOT_REPEATED,
        }
    }

    pub fn with_type(mut self, response_type: impl Into<String>) -> Self {
        self.response_type = Some(response_type.into());
        self
    }

    pub fn with_iteration(mut self, iteration: i32) -> Self {
        self.iteration = iteration;
        self
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    /// True when the question belongs to a repeatable group.
    pub fn is_answer_to_repeatable_group(&self) -> bool {
        self.iteration >= 0
    }

    /// Identity of this response within its survey instance.
    pub fn key(&self) -> ResponseKey {
        ResponseKey {
            question_id: self.question_id.clone(),
            iteration: self
                .is_answer_to_repeatable_group()
                .then_some(self.iteration),
        }
    }

    /// Copy of this response re-targeted at another instance, with the row id stripped.
    pub fn for_instance(&self, survey_instance_id: i64) -> Self {
        Self {
            id: None,
            survey_instance_id,
            ..self.clone()
        }
    }
}

/// Identity key of a response within a survey instance.
///
/// Non-repeated questions are identified by question id alone; repeatable
/// group answers also carry their iteration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResponseKey {
    pub question_id: String,
    pub iteration: Option<i32>,
}

impl fmt::Display for ResponseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.iteration {
            Some(iteration) => write!(f, "{}|{}", self.question_id, iteration),
            None => f.write_str(&self.question_id),
        }
    }
}

/// Split a legacy composite question id (`"<questionId>|<iteration>"`).
///
/// Returns the plain id and [`NOT_REPEATED`] when the id carries no numeric suffix.
pub fn split_legacy_question_id(raw: &str) -> (String, i32) {
    if let Some((question_id, suffix)) = raw.rsplit_once('|') {
        if let Ok(iteration) = suffix.trim().parse::<i32>() {
            if iteration >= 0 && !question_id.is_empty() {
                return (question_id.to_string(), iteration);
            }
        }
    }
    (raw.to_string(), NOT_REPEATED)
}

/// Clone a set of responses onto a new survey instance.
///
/// Every copy loses its row id so it is treated as an unseen row on save.
pub fn clone_for_new_instance<'a, I>(
    responses: I,
    new_survey_instance_id: i64,
) -> HashMap<ResponseKey, QuestionResponse>
where
    I: IntoIterator<Item = &'a QuestionResponse>,
{
    responses
        .into_iter()
        .map(|r| {
            let copy = r.for_instance(new_survey_instance_id);
            (copy.key(), copy)
        })
        .collect()
}

/// Registration metadata kept both on the record and as a synthetic response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationMeta {
    Name,
    Geolocation,
}

impl RegistrationMeta {
    /// Synthetic question id the metadata response is stored under.
    pub fn question_id(self) -> &'static str {
        match self {
            Self::Name => "localeNameQuestion",
            Self::Geolocation => "localeGeoQuestion",
        }
    }

    /// Response type tag of the metadata response.
    pub fn type_tag(self) -> &'static str {
        match self {
            Self::Name => "META_NAME",
            Self::Geolocation => "META_GEO",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn iteration_ignored_for_non_repeated_key() {
        let response = QuestionResponse::new(1, "q1", "a");
        assert_eq!(
            response.key(),
            ResponseKey {
                question_id: "q1".to_string(),
                iteration: None
            }
        );
        assert_eq!(response.key().to_string(), "q1");
    }

    #[test]
    fn repeated_keys_differ_by_iteration() {
        let first = QuestionResponse::new(1, "q1", "a").with_iteration(0);
        let second = QuestionResponse::new(1, "q1", "b").with_iteration(1);
        assert_ne!(first.key(), second.key());
        assert_eq!(second.key().to_string(), "q1|1");
    }

    #[test]
    fn clone_strips_ids() {
        let mut original = QuestionResponse::new(7, "q1", "a").with_type("VALUE");
        original.id = Some(42);
        let repeated = QuestionResponse {
            id: Some(43),
            ..QuestionResponse::new(7, "q2", "b").with_iteration(2)
        };

        let cloned = clone_for_new_instance([&original, &repeated], 9);

        assert_eq!(cloned.len(), 2);
        for response in cloned.values() {
            assert_eq!(response.id, None);
            assert_eq!(response.survey_instance_id, 9);
        }
        assert_eq!(cloned[&original.key()].response_type.as_deref(), Some("VALUE"));
        assert_eq!(cloned[&repeated.key()].iteration, 2);
    }

    #[test]
    fn legacy_question_ids_are_split() {
        assert_eq!(split_legacy_question_id("123|2"), ("123".to_string(), 2));
        assert_eq!(split_legacy_question_id("123"), ("123".to_string(), NOT_REPEATED));
        assert_eq!(split_legacy_question_id("a|b"), ("a|b".to_string(), NOT_REPEATED));
        assert_eq!(split_legacy_question_id("|3"), ("|3".to_string(), NOT_REPEATED));
    }
}
