use std::collections::BTreeMap;

use crate::error::DemoError;
use crate::support::{format_error_chain, truncate_utf8};

const MAX_MESSAGE_BYTES: usize = 32 * 1024;
const MAX_HINT_BYTES: usize = 8 * 1024;
const MAX_DETAIL_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ErrorPayload {
    pub fn new(
        code: &str,
        message: impl Into<String>,
        details: Option<BTreeMap<String, String>>,
        hint: Option<String>,
    ) -> Self {
        let message = truncate_utf8(&message.into(), MAX_MESSAGE_BYTES);

        let details = details.map(|mut m| {
            for v in m.values_mut() {
                *v = truncate_utf8(v, MAX_DETAIL_BYTES);
            }
            m
        });

        let hint = hint.map(|h| truncate_utf8(&h, MAX_HINT_BYTES));

        Self {
            code: code.to_string(),
            message,
            retryable: false,
            details,
            hint,
        }
    }
}

impl From<&DemoError> for ErrorPayload {
    fn from(err: &DemoError) -> Self {
        let mut details = BTreeMap::new();
        let message = match err {
            DemoError::Internal(inner) => format_error_chain(inner),
            other => other.to_string(),
        };

        match err {
            DemoError::EntryNotFound { tried, present, .. } => {
                details.insert("tried".to_string(), tried.join("\n"));
                details.insert("present".to_string(), present.join("\n"));
            }
            DemoError::SpawnFailed { output, .. } if !output.is_empty() => {
                details.insert("output".to_string(), output.clone());
            }
            DemoError::ProvisionFailed { stage, .. } => {
                details.insert("stage".to_string(), stage.to_string());
            }
            _ => {}
        }

        let mut payload = ErrorPayload::new(
            err.code(),
            message,
            (!details.is_empty()).then_some(details),
            err.hint(),
        );
        payload.retryable = err.is_retryable();
        payload
    }
}
