use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolManagerErrorCode {
    InvalidToolId,
    AlreadyRunning,
    NotRunning,
    NotBuildable,
    BinaryMissing,
    BuildFailed,
    StartFailed,
    CallFailed,
    ToolError,
    MaxRestartsExceeded,
}

impl ToolManagerErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidToolId => "invalid_tool_id",
            Self::AlreadyRunning => "already_running",
            Self::NotRunning => "not_running",
            Self::NotBuildable => "not_buildable",
            Self::BinaryMissing => "binary_missing",
            Self::BuildFailed => "build_failed",
            Self::StartFailed => "start_failed",
            Self::CallFailed => "call_failed",
            Self::ToolError => "tool_error",
            Self::MaxRestartsExceeded => "max_restarts_exceeded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ToolManagerError {
    pub code: ToolManagerErrorCode,
    pub message: String,
    /// HTTP status returned by the tool, set for `ToolError`.
    pub http_status: Option<u16>,
    /// Raw response body returned by the tool, set for `ToolError`.
    pub body: Option<Vec<u8>>,
}

impl ToolManagerError {
    pub fn new(code: ToolManagerErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            http_status: None,
            body: None,
        }
    }

    pub fn tool_error(http_status: u16, body: Vec<u8>) -> Self {
        let preview = String::from_utf8_lossy(&body).into_owned();
        Self {
            code: ToolManagerErrorCode::ToolError,
            message: format!("tool returned status {http_status}: {preview}"),
            http_status: Some(http_status),
            body: Some(body),
        }
    }

    pub fn is(&self, code: ToolManagerErrorCode) -> bool {
        self.code == code
    }
}

pub type ToolManagerResult<T> = Result<T, ToolManagerError>;
