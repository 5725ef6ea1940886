//! Classification of smart HTTP requests.
//!
//! A request is described by its method and raw request URI (path and query).
//! Two independent matches are made: the service named by the URI, and the
//! repository named by the path.

use crate::pktline::FLUSH_PKT;
use crate::{GitError, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};

/// Matches the service named at the end of a request URI.
static SERVICE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:/info/refs\?service=|/)(git-(?:receive|upload)-pack)$").expect("Invalid regex")
});

/// Matches a request path ending in a smart HTTP endpoint, capturing the
/// repository part in front of it.
static REPO_PATH_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(.*?)/(?:info/refs|git-upload-pack|git-receive-pack)$").expect("Invalid regex")
});

/// The git service a request is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceType {
    /// `git-upload-pack` (fetch and clone).
    UploadPack,
    /// `git-receive-pack` (push).
    ReceivePack,
}

impl ServiceType {
    /// Returns the executable name of the service.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UploadPack => "git-upload-pack",
            Self::ReceivePack => "git-receive-pack",
        }
    }

    /// Parses an executable name such as `git-receive-pack`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "git-upload-pack" => Some(Self::UploadPack),
            "git-receive-pack" => Some(Self::ReceivePack),
            _ => None,
        }
    }

    /// The `git` subcommand implementing this service.
    pub fn subcommand(&self) -> &'static str {
        match self {
            Self::UploadPack => "upload-pack",
            Self::ReceivePack => "receive-pack",
        }
    }

    /// Response content type, e.g. `application/x-git-receive-pack-result`.
    pub fn content_type(&self, advertisement: bool) -> String {
        let kind = if advertisement { "advertisement" } else { "result" };
        format!("application/x-{}-{}", self.as_str(), kind)
    }

    /// Returns true for `git-receive-pack`.
    pub fn is_receive_pack(&self) -> bool {
        matches!(self, Self::ReceivePack)
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detects the service from a request URI (path plus query).
pub fn detect_service(request_uri: &str) -> Result<ServiceType> {
    SERVICE_REGEX
        .captures(request_uri)
        .and_then(|caps| caps.get(1))
        .and_then(|m| ServiceType::from_name(m.as_str()))
        .ok_or_else(|| GitError::NoMatchingService(request_uri.to_string()))
}

/// Extracts the repository name from a request URI.
///
/// The smart HTTP endpoint suffix and any query are stripped and leading
/// slashes trimmed: `/adam/project.git/info/refs?service=git-receive-pack`
/// names `adam/project.git`.
pub fn parse_repo_name(request_uri: &str) -> Result<String> {
    let path = request_uri.split('?').next().unwrap_or_default();
    let not_git = || GitError::NotAGitRequest(request_uri.to_string());

    let caps = REPO_PATH_REGEX.captures(path).ok_or_else(not_git)?;
    let name = caps
        .get(1)
        .map(|m| m.as_str().trim_start_matches('/'))
        .unwrap_or_default();

    if name.is_empty() || name.split('/').any(|seg| seg == "." || seg == "..") {
        return Err(not_git());
    }

    Ok(name.to_string())
}

/// A classified smart HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRequest {
    /// Service the request is addressed to.
    pub service: ServiceType,
    /// GET requests are ref advertisements.
    pub is_advertisement: bool,
    /// GET `/info/refs?service=...` discovery; the response starts with the
    /// `# service=` preamble.
    pub is_get_refs_discovery: bool,
    /// Repository name relative to the storage root.
    pub repo_name: String,
    /// Repository location on disk.
    pub full_repo_path: PathBuf,
    /// Whether the push hooks apply to this request.
    pub should_run_hooks: bool,
}

impl ServiceRequest {
    /// Classifies a request.
    ///
    /// `body` is only inspected to disable hooks for empty pushes, which carry
    /// no ref update.
    pub fn classify(
        method: &str,
        request_uri: &str,
        body: &[u8],
        storage_root: &Path,
    ) -> Result<Self> {
        let service = detect_service(request_uri)?;
        let repo_name = parse_repo_name(request_uri)?;

        let is_advertisement = method.eq_ignore_ascii_case("GET");
        let is_get_refs_discovery = is_advertisement && request_uri.contains("/info/refs?service=");
        let empty_push = body.is_empty() || body == FLUSH_PKT;
        let should_run_hooks = service.is_receive_pack() && !is_advertisement && !empty_push;

        tracing::trace!(
            service = %service,
            repo = %repo_name,
            advertisement = is_advertisement,
            hooks = should_run_hooks,
            "Classified request"
        );

        Ok(Self {
            service,
            is_advertisement,
            is_get_refs_discovery,
            full_repo_path: storage_root.join(&repo_name),
            repo_name,
            should_run_hooks,
        })
    }

    /// Response content type for this request.
    pub fn content_type(&self) -> String {
        self.service.content_type(self.is_advertisement)
    }
}
