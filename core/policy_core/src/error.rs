use axum::http::StatusCode;
use thiserror::Error;

/// Failures reported back to the caller of a policy command.
///
/// Every variant carries a stable machine code (see [`PolicyError::code`])
/// that the HTTP layer puts into `ErrResponse.error`.
#[derive(Error, Debug)]
pub enum PolicyError {
    // Input validation
    #[error("rule pattern is empty")]
    MissingPattern,

    #[error("invalid regex pattern: {0}")]
    InvalidRegex(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("invalid hostname: {0}")]
    InvalidHostname(String),

    #[error("override minutes must be positive, got {0}")]
    InvalidMinutes(i64),

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("duplicate rule id: {0}")]
    DuplicateRuleId(String),

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    // Authorization
    #[error("PIN required")]
    PinRequired,

    #[error("invalid PIN")]
    InvalidPin,

    #[error("rule not found: {0}")]
    NotFound(String),

    // External dependencies
    #[error("storage error: {0}")]
    Storage(String),

    #[error("interception layer error: {0}")]
    Interception(String),

    #[error("policy engine is not running")]
    EngineUnavailable,
}

impl PolicyError {
    pub fn code(&self) -> &'static str {
        match self {
            PolicyError::MissingPattern => "missing_pattern",
            PolicyError::InvalidRegex(_) => "invalid_regex",
            PolicyError::InvalidUrl(_) => "invalid_url",
            PolicyError::InvalidHostname(_) => "invalid_hostname",
            PolicyError::InvalidMinutes(_) => "invalid_minutes",
            PolicyError::InvalidSchedule(_) => "invalid_schedule",
            PolicyError::DuplicateRuleId(_) => "duplicate_rule_id",
            PolicyError::InvalidSettings(_) => "invalid_settings",
            PolicyError::PinRequired => "pin_required",
            PolicyError::InvalidPin => "invalid_pin",
            PolicyError::NotFound(_) => "not_found",
            PolicyError::Storage(_) => "storage_error",
            PolicyError::Interception(_) => "interception_error",
            PolicyError::EngineUnavailable => "engine_unavailable",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            PolicyError::MissingPattern
            | PolicyError::InvalidRegex(_)
            | PolicyError::InvalidUrl(_)
            | PolicyError::InvalidHostname(_)
            | PolicyError::InvalidMinutes(_)
            | PolicyError::InvalidSchedule(_)
            | PolicyError::DuplicateRuleId(_)
            | PolicyError::InvalidSettings(_) => StatusCode::BAD_REQUEST,
            PolicyError::PinRequired | PolicyError::InvalidPin => StatusCode::FORBIDDEN,
            PolicyError::NotFound(_) => StatusCode::NOT_FOUND,
            PolicyError::Storage(_) | PolicyError::Interception(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            PolicyError::EngineUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl From<rusqlite::Error> for PolicyError {
    fn from(err: rusqlite::Error) -> Self {
        PolicyError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for PolicyError {
    fn from(err: serde_json::Error) -> Self {
        PolicyError::Storage(format!("JSON error: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, PolicyError>;
