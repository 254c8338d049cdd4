//! Runtime error types
//!
//! The runtime shares the core error taxonomy; failures that are recovered
//! into run results are carried as [`FailureDetail`].

use serde::{Deserialize, Serialize};

pub use conflux_core::error::{Error, ErrorKind, Result};

/// Serializable description of one failure inside a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureDetail {
    /// Classification
    pub kind: ErrorKind,
    /// Human readable message
    pub message: String,
    /// Stage or step the failure happened in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// Record the failure is about
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<String>,
}

impl FailureDetail {
    /// Detail for an error
    pub fn from_error(error: &Error) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
            stage: None,
            record_id: None,
        }
    }

    /// Attribute to a stage or step
    pub fn at(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    /// Attribute to a record
    pub fn for_record(mut self, record_id: impl Into<String>) -> Self {
        self.record_id = Some(record_id.into());
        self
    }
}

impl From<&Error> for FailureDetail {
    fn from(error: &Error) -> Self {
        Self::from_error(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_detail_from_error() {
        let err = Error::Validation {
            record_id: "r1".to_string(),
            message: "email missing".to_string(),
        };
        let detail = FailureDetail::from(&err).at("validate").for_record("r1");
        assert_eq!(detail.kind, ErrorKind::Validation);
        assert!(detail.message.contains("email missing"));

        let json = serde_json::to_value(&detail).unwrap();
        assert_eq!(json["kind"], "Validation");
        assert_eq!(json["stage"], "validate");
        assert_eq!(json["recordId"], "r1");
    }
}
