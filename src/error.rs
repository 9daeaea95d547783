use thiserror::Error;

/// Crate-wide error taxonomy.
///
/// Every variant carries enough context to produce both a human sentence
/// (via `Display`) and a stable machine-readable code (via `code()`), and
/// maps to an HTTP status the gateway can return to its callers.
#[derive(Error, Debug)]
pub enum Error {
    #[error("config: missing required key '{0}'")]
    ConfigMissingRequired(String),

    #[error("config: value '{value}' for key '{key}' is not a valid {expected}")]
    ConfigTypeError {
        key: String,
        value: String,
        expected: String,
    },

    #[error("config: unknown schema reference '{0}'")]
    ConfigUnknownReference(String),

    #[error("template '{0}' not found")]
    TemplateNotFound(String),

    #[error("template '{id}' manifest is malformed: {reason}")]
    TemplateMalformed { id: String, reason: String },

    #[error("template id collision: '{0}' is declared by more than one candidate")]
    TemplateIdCollision(String),

    #[error("backend runtime unreachable: {0}")]
    BackendUnreachable(String),

    #[error("backend image pull failed for '{image}': {reason}")]
    BackendImagePullFailed { image: String, reason: String },

    #[error("backend quota exceeded: {0}")]
    BackendQuotaExceeded(String),

    #[error("backend permission denied: {0}")]
    BackendPermissionDenied(String),

    #[error("deployment '{0}' not found")]
    DeploymentNotFound(String),

    #[error("deployment '{id}' did not stop within {timeout_secs}s")]
    DeploymentStopTimeout { id: String, timeout_secs: u64 },

    #[error("deployment '{0}' status probe failed")]
    DeploymentStatusProbeFailed(String),

    #[error("MCP protocol version incompatible: {0}")]
    ProtocolIncompatible(String),

    #[error("MCP protocol error: {0}")]
    ProtocolError(String),

    #[error("MCP session dropped: {0}")]
    SessionDropped(String),

    #[error("unknown tool '{0}'")]
    ToolUnknown(String),

    #[error("invalid arguments for tool '{tool}': {details}")]
    ToolArgumentInvalid { tool: String, details: String },

    #[error("remote tool error from '{tool}': {message}")]
    ToolRemoteError { tool: String, message: String },

    #[error("no healthy instance for server '{0}'")]
    GatewayNoHealthyInstance(String),

    #[error("request queue overflow for server '{0}'")]
    GatewayQueueOverflow(String),

    #[error("request timed out")]
    Timeout,

    #[error("operation canceled")]
    Canceled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Stable machine-readable code, independent of the human sentence.
    pub fn code(&self) -> &'static str {
        match self {
            Error::ConfigMissingRequired(_) => "config_missing_required",
            Error::ConfigTypeError { .. } => "config_type_error",
            Error::ConfigUnknownReference(_) => "config_unknown_reference",
            Error::TemplateNotFound(_) => "template_not_found",
            Error::TemplateMalformed { .. } => "template_malformed",
            Error::TemplateIdCollision(_) => "template_id_collision",
            Error::BackendUnreachable(_) => "backend_unreachable",
            Error::BackendImagePullFailed { .. } => "backend_image_pull_failed",
            Error::BackendQuotaExceeded(_) => "backend_quota_exceeded",
            Error::BackendPermissionDenied(_) => "backend_permission_denied",
            Error::DeploymentNotFound(_) => "deployment_not_found",
            Error::DeploymentStopTimeout { .. } => "deployment_stop_timeout",
            Error::DeploymentStatusProbeFailed(_) => "deployment_status_probe_failed",
            Error::ProtocolIncompatible(_) => "protocol_incompatible",
            Error::ProtocolError(_) => "protocol_error",
            Error::SessionDropped(_) => "session_dropped",
            Error::ToolUnknown(_) => "tool_unknown",
            Error::ToolArgumentInvalid { .. } => "tool_argument_invalid",
            Error::ToolRemoteError { .. } => "tool_remote_error",
            Error::GatewayNoHealthyInstance(_) => "gateway_no_healthy_instance",
            Error::GatewayQueueOverflow(_) => "gateway_queue_overflow",
            Error::Timeout => "timeout",
            Error::Canceled => "canceled",
            Error::Other(_) => "internal_error",
        }
    }

    /// HTTP status the gateway should return for this error, per the kind
    /// to status mapping table.
    pub fn to_http_status(&self) -> http::StatusCode {
        use http::StatusCode;
        match self {
            Error::ConfigMissingRequired(_)
            | Error::ConfigTypeError { .. }
            | Error::ConfigUnknownReference(_)
            | Error::ToolArgumentInvalid { .. } => StatusCode::BAD_REQUEST,

            Error::TemplateNotFound(_)
            | Error::TemplateMalformed { .. }
            | Error::ToolUnknown(_)
            | Error::DeploymentNotFound(_) => StatusCode::NOT_FOUND,

            Error::BackendUnreachable(_)
            | Error::BackendImagePullFailed { .. }
            | Error::BackendQuotaExceeded(_)
            | Error::BackendPermissionDenied(_)
            | Error::ProtocolIncompatible(_)
            | Error::ProtocolError(_)
            | Error::SessionDropped(_)
            | Error::ToolRemoteError { .. }
            | Error::TemplateIdCollision(_)
            | Error::DeploymentStatusProbeFailed(_) => StatusCode::BAD_GATEWAY,

            Error::GatewayQueueOverflow(_) => StatusCode::SERVICE_UNAVAILABLE,

            Error::Timeout | Error::Canceled | Error::DeploymentStopTimeout { .. } => {
                StatusCode::GATEWAY_TIMEOUT
            }

            Error::GatewayNoHealthyInstance(_) => StatusCode::SERVICE_UNAVAILABLE,

            Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl axum::response::IntoResponse for Error {
    fn into_response(self) -> axum::response::Response {
        let status = self.to_http_status();
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        });
        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_map_to_400() {
        let err = Error::ConfigMissingRequired("greeting".into());
        assert_eq!(err.to_http_status(), http::StatusCode::BAD_REQUEST);
        assert_eq!(err.code(), "config_missing_required");
    }

    #[test]
    fn unknown_tool_maps_to_404() {
        let err = Error::ToolUnknown("nope".into());
        assert_eq!(err.to_http_status(), http::StatusCode::NOT_FOUND);
    }

    #[test]
    fn queue_overflow_maps_to_503() {
        let err = Error::GatewayQueueOverflow("demo".into());
        assert_eq!(err.to_http_status(), http::StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn backend_unreachable_maps_to_502() {
        let err = Error::BackendUnreachable("docker daemon down".into());
        assert_eq!(err.to_http_status(), http::StatusCode::BAD_GATEWAY);
    }
}
