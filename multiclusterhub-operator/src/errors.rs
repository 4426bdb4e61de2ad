use std::time::Duration;

/// Extension methods for Kubernetes API errors.
pub(crate) trait ExtKubeApiError {
    fn is_not_found(&self) -> bool;
    fn is_conflict(&self) -> bool;
}

impl ExtKubeApiError for kube::Error {
    fn is_not_found(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 404 || e.code == 410 => true,
            _ => false,
        }
    }

    fn is_conflict(&self) -> bool {
        match self {
            kube::Error::Api(e) if e.code == 409 => true,
            _ => false,
        }
    }
}

impl ExtKubeApiError for ControllerError {
    fn is_not_found(&self) -> bool {
        match self {
            ControllerError::KubeApi(e) => e.is_not_found(),
            _ => false,
        }
    }

    fn is_conflict(&self) -> bool {
        match self {
            ControllerError::KubeApi(e) => e.is_conflict(),
            _ => false,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum ControllerError {
    /// Kubernetes API error
    #[error("{0}")]
    KubeApi(#[from] kube::Error),
    /// A single API call did not complete within the request timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// Image manifest, override config-map or image key could not be used.
    #[error("malformed configuration: {0}")]
    MalformedConfiguration(String),
    /// An object crossing the cluster client seam lacks required fields.
    #[error("invalid object: {0}")]
    InvalidObject(String),
    /// Some uninstall targets could not be deleted.
    #[error("{0}")]
    UninstallFailed(String),
    /// Serialization errors
    #[error("{0}")]
    Serde(#[from] serde_json::Error),
    /// Any other kind of errors
    #[error("{0}")]
    Any(#[from] anyhow::Error),
}

impl ControllerError {
    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        ControllerError::MalformedConfiguration(message.into())
    }

    pub(crate) fn is_temporary(&self) -> bool {
        match self {
            ControllerError::MalformedConfiguration(_) => false,
            ControllerError::InvalidObject(_) => false,
            ControllerError::Serde(_) => false,
            _ => true,
        }
    }
}

#[cfg(test)]
pub(crate) fn api_error(code: u16, reason: &str) -> ControllerError {
    ControllerError::KubeApi(kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{} ({})", reason, code),
        reason: reason.to_string(),
        code,
    }))
}
