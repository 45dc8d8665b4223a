use crate::address::WidgetAddress;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("duplicate child id '{child_id}' under {parent}")]
    DuplicateChildId {
        parent: WidgetAddress,
        child_id: String,
    },

    #[error("invalid child id '{child_id}'")]
    InvalidChildId { child_id: String },

    #[error("parent widget {0} is not mounted")]
    UnknownParent(WidgetAddress),

    #[error("widget {0} is not mounted")]
    UnknownWidget(WidgetAddress),

    #[error(transparent)]
    State(#[from] StateError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config for widget type '{widget_type}': {reason}")]
    InvalidConfig { widget_type: String, reason: String },

    #[error("failed to parse config for widget type '{widget_type}': {source}")]
    Parse {
        widget_type: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to read config for widget type '{widget_type}': {source}")]
    Io {
        widget_type: String,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    pub(crate) fn invalid(widget_type: &str, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            widget_type: widget_type.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("field '{0}' is not declared by the widget config")]
    UndeclaredField(String),

    #[error("field '{0}' is backend-owned and cannot be written by the UI")]
    BackendOwned(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncFailure {
    #[error("registration failed: {reason}")]
    RegistrationFailed { reason: String },
}
