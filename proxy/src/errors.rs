use crate::config::ValidationError;
use crate::crypto::DecryptError;
use crate::settings::ResolveError;
use crate::template::TemplateError;
use std::io;

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("http client error: {0}")]
    Client(#[from] reqwest::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ValidationError),
}

/// Settings could not be produced for a plugin: either the lookup or the decryption failed.
#[derive(thiserror::Error, Debug)]
pub enum LookupError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Decrypt(#[from] DecryptError),
}

/// Why a templated value could not become part of the outbound request.
#[derive(thiserror::Error, Debug)]
pub enum RenderError {
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error("rendered value is not a valid header value")]
    InvalidHeaderValue,
    #[error("invalid header name")]
    InvalidHeaderName,
    #[error("rendered url does not parse: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("rendered url must be absolute http(s) with a host")]
    UnsupportedUrl,
    #[error("rendered url is not a valid request target")]
    InvalidUri,
}

/// Every way rewriting a plugin request can fail. All of them are terminal: the request is
/// answered with a 500 and never forwarded.
///
/// Messages name keys, headers and parameters, never configuration or secret values.
#[derive(thiserror::Error, Debug)]
pub enum DirectorError {
    #[error("failed to fetch plugin settings: {0}")]
    ConfigurationLookupFailed(#[from] LookupError),
    #[error("failed to serialize caller context: {0}")]
    ContextSerializationFailed(String),
    #[error("failed to render plugin header `{header}`: {source}")]
    HeaderTemplateError { header: String, source: RenderError },
    #[error("failed to render plugin route url: {0}")]
    RouteUrlTemplateError(RenderError),
    #[error("failed to render plugin url parameter `{param}`: {source}")]
    UrlParamTemplateError { param: String, source: RenderError },
    #[error("static route target is templated or not a valid request target")]
    InvalidTarget,
}

impl DirectorError {
    /// Short stable name, used as a metric tag.
    pub fn kind(&self) -> &'static str {
        match self {
            DirectorError::ConfigurationLookupFailed(_) => "configuration_lookup_failed",
            DirectorError::ContextSerializationFailed(_) => "context_serialization_failed",
            DirectorError::HeaderTemplateError { .. } => "header_template_error",
            DirectorError::RouteUrlTemplateError(_) => "route_url_template_error",
            DirectorError::UrlParamTemplateError { .. } => "url_param_template_error",
            DirectorError::InvalidTarget => "invalid_target",
        }
    }
}

impl From<ResolveError> for DirectorError {
    fn from(e: ResolveError) -> Self {
        DirectorError::ConfigurationLookupFailed(e.into())
    }
}

impl From<DecryptError> for DirectorError {
    fn from(e: DecryptError) -> Self {
        DirectorError::ConfigurationLookupFailed(e.into())
    }
}
