use alayasiki_core::error::{AlayasikiError, ErrorCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Downstream-answerer hint carried through untouched by the pipeline (spec
/// §6: `mode` is part of the wire contract but the retrieval stages
/// themselves are mode-agnostic).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetrieveMode {
    #[default]
    Recall,
    Reflection,
    Projection,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RetrieveRequest {
    pub org_id: String,
    pub principal_id: String,
    #[serde(default)]
    pub mode: RetrieveMode,
    pub query_text: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RetrieveValidationError {
    #[error("org_id must not be empty")]
    EmptyOrgId,
    #[error("principal_id must not be empty")]
    EmptyPrincipalId,
    #[error("query_text must not be empty")]
    EmptyQuery,
}

impl AlayasikiError for RetrieveValidationError {
    fn error_code(&self) -> ErrorCode {
        ErrorCode::InvalidArgument
    }
}

impl RetrieveRequest {
    pub fn parse_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn validate(&self) -> Result<(), RetrieveValidationError> {
        if self.org_id.trim().is_empty() {
            return Err(RetrieveValidationError::EmptyOrgId);
        }
        if self.principal_id.trim().is_empty() {
            return Err(RetrieveValidationError::EmptyPrincipalId);
        }
        if self.query_text.trim().is_empty() {
            return Err(RetrieveValidationError::EmptyQuery);
        }
        Ok(())
    }
}
