use crate::identity::OrgRole;
use crate::template::{Template, TemplateError};
use http::header::{COOKIE, HeaderName, SET_COOKIE};
use serde::Deserialize;
use shared::path::PathPattern;
use std::collections::HashMap;
use std::sync::Arc;
use url::Url;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum RouteError {
    #[error("route `{path}`: url must be an absolute http(s) url with a host")]
    InvalidUrl { path: String },
    #[error("route `{path}`: url contains a template placeholder, use dynamic_url instead")]
    TemplatedUrl { path: String },
    #[error("route `{path}`: invalid header name `{name}`")]
    InvalidHeaderName { path: String, name: String },
    #[error("route `{path}`: header `{name}` can not be set by a route")]
    ForbiddenHeader { path: String, name: String },
    #[error("route `{path}`: template for `{field}`: {source}")]
    Template {
        path: String,
        field: String,
        source: TemplateError,
    },
}

/// HTTP methods supported for route matching
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
    Options,
}

impl PartialEq<http::Method> for HttpMethod {
    fn eq(&self, other: &http::Method) -> bool {
        let expected = match self {
            HttpMethod::Get => http::Method::GET,
            HttpMethod::Head => http::Method::HEAD,
            HttpMethod::Post => http::Method::POST,
            HttpMethod::Put => http::Method::PUT,
            HttpMethod::Patch => http::Method::PATCH,
            HttpMethod::Delete => http::Method::DELETE,
            HttpMethod::Options => http::Method::OPTIONS,
        };
        expected == *other
    }
}

/// A name plus a template producing its value. Used for both headers and query parameters.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct TemplatedParam {
    pub name: String,
    pub content: String,
}

/// How to reach one plugin backend and what to attach to requests sent to it.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Route {
    /// Prefix of the proxy path this route handles, relative to the plugin root.
    #[serde(default)]
    pub path: String,
    pub method: Option<HttpMethod>,
    pub req_role: Option<OrgRole>,
    /// Static target. Always applied first so a request never leaves with its inbound target.
    pub url: Url,
    /// Optional target computed from the plugin settings. When present it supersedes `url`.
    pub dynamic_url: Option<String>,
    #[serde(default)]
    pub headers: Vec<TemplatedParam>,
    #[serde(default)]
    pub url_params: Vec<TemplatedParam>,
}

impl Route {
    /// A route targeting `url` for every path and method, with no headers.
    pub fn new(url: Url) -> Self {
        Route {
            path: String::new(),
            method: None,
            req_role: None,
            url,
            dynamic_url: None,
            headers: Vec::new(),
            url_params: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, content: &str) -> Self {
        self.headers.push(TemplatedParam {
            name: name.to_string(),
            content: content.to_string(),
        });
        self
    }

    pub fn with_url_param(mut self, name: &str, content: &str) -> Self {
        self.url_params.push(TemplatedParam {
            name: name.to_string(),
            content: content.to_string(),
        });
        self
    }

    pub fn with_dynamic_url(mut self, template: &str) -> Self {
        self.dynamic_url = Some(template.to_string());
        self
    }

    /// The dynamic target template, if one is configured and non-empty.
    pub fn dynamic_url(&self) -> Option<&str> {
        self.dynamic_url.as_deref().filter(|t| !t.trim().is_empty())
    }

    /// True if the static `url` carries template placeholders. Those are never rendered: the
    /// host keeps them verbatim and the path percent-encodes them.
    pub fn has_templated_url(&self) -> bool {
        let raw = self.url.as_str();
        raw.contains("{{") || raw.to_ascii_uppercase().contains("%7B%7B")
    }

    /// Checks everything that can be checked without plugin settings.
    pub fn validate(&self) -> Result<(), RouteError> {
        let template_err = |field: &str, source| RouteError::Template {
            path: self.path.clone(),
            field: field.to_string(),
            source,
        };

        if !matches!(self.url.scheme(), "http" | "https") || self.url.host_str().is_none() {
            return Err(RouteError::InvalidUrl {
                path: self.path.clone(),
            });
        }
        if self.has_templated_url() {
            return Err(RouteError::TemplatedUrl {
                path: self.path.clone(),
            });
        }

        if let Some(dynamic_url) = self.dynamic_url() {
            Template::parse(dynamic_url).map_err(|e| template_err("dynamic_url", e))?;
        }

        for header in &self.headers {
            let name = HeaderName::from_bytes(header.name.as_bytes()).map_err(|_| {
                RouteError::InvalidHeaderName {
                    path: self.path.clone(),
                    name: header.name.clone(),
                }
            })?;
            if name == COOKIE || name == SET_COOKIE {
                return Err(RouteError::ForbiddenHeader {
                    path: self.path.clone(),
                    name: header.name.clone(),
                });
            }
            Template::parse(&header.content).map_err(|e| template_err(&header.name, e))?;
        }

        for param in &self.url_params {
            Template::parse(&param.content).map_err(|e| template_err(&param.name, e))?;
        }

        Ok(())
    }
}

/// Plugin declared routes, in declaration order.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct PluginRoutes {
    pub id: String,
    pub routes: Vec<Route>,
}

/// A route selected for an inbound request.
#[derive(Clone, Debug)]
pub struct RouteMatch {
    pub route: Arc<Route>,
    /// The part of the inbound path that follows the route path. Appended to whichever target
    /// base path ends up in effect.
    pub proxy_path: String,
}

/// Routes of every known plugin, compiled for matching. Shared read-only across requests.
#[derive(Debug, Default)]
pub struct RouteTable {
    plugins: HashMap<String, Vec<(PathPattern, Arc<Route>)>>,
}

impl RouteTable {
    pub fn new(plugins: Vec<PluginRoutes>) -> Self {
        let plugins = plugins
            .into_iter()
            .map(|plugin| {
                let routes = plugin
                    .routes
                    .into_iter()
                    .map(|route| {
                        let pattern = PathPattern::parse(&format!("{}/*", route.path));
                        (pattern, Arc::new(route))
                    })
                    .collect();
                (plugin.id, routes)
            })
            .collect();

        RouteTable { plugins }
    }

    pub fn has_plugin(&self, plugin_id: &str) -> bool {
        self.plugins.contains_key(plugin_id)
    }

    /// Finds the first route of `plugin_id` whose path is a segment prefix of `path` and whose
    /// method, if any, matches.
    pub fn find(&self, plugin_id: &str, path: &str, method: &http::Method) -> Option<RouteMatch> {
        self.plugins
            .get(plugin_id)?
            .iter()
            .filter(|(_, route)| route.method.is_none_or(|m| m == *method))
            .find_map(|(pattern, route)| {
                pattern.matches(path).map(|m| RouteMatch {
                    route: route.clone(),
                    proxy_path: m.rest.to_string(),
                })
            })
    }
}
