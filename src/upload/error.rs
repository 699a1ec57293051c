// Upload error taxonomy and classification of raw transport failures

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

/// One variant per failure kind; the pipeline's retry policy matches on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UploadError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Remote storage quota: {0}")]
    Quota(String),

    #[error("Local file error: {0}")]
    File(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("Destination not configured: {0}")]
    Config(String),

    #[error("Remote folder not found: {0}")]
    FolderNotFound(String),
}

impl UploadError {
    /// Terminal for the segment; never retried by the pipeline.
    pub fn is_permanent(&self) -> bool {
        matches!(self, UploadError::Auth(_) | UploadError::Config(_) | UploadError::File(_))
    }

    /// Whether the user should hear about it.
    pub fn needs_attention(&self) -> bool {
        matches!(self, UploadError::Auth(_) | UploadError::Config(_) | UploadError::Quota(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Auth,
    Network,
    Quota,
    File,
    Server,
    Config,
    FolderNotFound,
}

/// What a transport reports when an upload fails.
#[derive(Error, Debug, Clone, PartialEq, Eq, Default)]
#[error("{message}")]
pub struct TransportError {
    /// Set when the transport already knows the kind.
    pub category: Option<ErrorCategory>,
    /// Vendor error code, e.g. `path/not_found/`.
    pub code: Option<String>,
    pub message: String,
    pub http_status: Option<u16>,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), ..Default::default() }
    }

    pub fn categorized(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self { category: Some(category), message: message.into(), ..Default::default() }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }
}

static AUTH_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)invalid_access_token|expired_access_token|token.*expired|unauthori[sz]ed|invalid.?credentials").ok()
});
static QUOTA_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)insufficient_space|quota|too_many_requests|rate.?limit|storage is full").ok()
});
static FOLDER_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)path/not_found|folder not found|no such (file or )?directory").ok()
});
static NETWORK_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)timed? ?out|connection|unknown host|dns|network|unreachable").ok()
});

fn hit(re: &Option<Regex>, haystack: &str) -> bool {
    re.as_ref().map(|r| r.is_match(haystack)).unwrap_or(false)
}

/// Map a raw transport failure into the taxonomy. Explicit categories win,
/// then vendor codes/messages, then HTTP status. Anything left is a server fault.
pub fn classify(err: &TransportError) -> UploadError {
    let msg = err.message.clone();
    if let Some(category) = err.category {
        return from_category(category, msg);
    }

    let haystack = match &err.code {
        Some(code) => format!("{} {}", code, err.message),
        None => err.message.clone(),
    };

    if hit(&AUTH_RE, &haystack) {
        return UploadError::Auth(msg);
    }
    if hit(&QUOTA_RE, &haystack) {
        return UploadError::Quota(msg);
    }
    if hit(&FOLDER_RE, &haystack) {
        return UploadError::FolderNotFound(msg);
    }

    match err.http_status {
        Some(401) | Some(403) => return UploadError::Auth(msg),
        Some(429) | Some(507) => return UploadError::Quota(msg),
        Some(404) | Some(409) => return UploadError::FolderNotFound(msg),
        Some(s) if s >= 500 => return UploadError::Server(msg),
        _ => {}
    }

    if hit(&NETWORK_RE, &haystack) {
        return UploadError::Network(msg);
    }
    UploadError::Server(msg)
}

fn from_category(category: ErrorCategory, msg: String) -> UploadError {
    match category {
        ErrorCategory::Auth => UploadError::Auth(msg),
        ErrorCategory::Network => UploadError::Network(msg),
        ErrorCategory::Quota => UploadError::Quota(msg),
        ErrorCategory::File => UploadError::File(msg),
        ErrorCategory::Server => UploadError::Server(msg),
        ErrorCategory::Config => UploadError::Config(msg),
        ErrorCategory::FolderNotFound => UploadError::FolderNotFound(msg),
    }
}
