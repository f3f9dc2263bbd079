//! Rewrites an inbound plugin proxy request into the request sent to the plugin backend.
//!
//! The director works on staged copies of the target and header set and only writes them back
//! into the request once every step has succeeded, so a failure never leaves a half rewritten
//! request behind.

use crate::crypto::SecretDecryptor;
use crate::errors::{DirectorError, RenderError};
use crate::identity::CallerIdentity;
use crate::route::Route;
use crate::settings::ConfigurationResolver;
use crate::template::{Template, TemplateData};
use crate::utils::join_url_fragments;
use http::header::{COOKIE, HOST, HeaderMap, HeaderName, HeaderValue, SET_COOKIE};
use http::{Request, Uri};
use shared::http::{ClientAddr, filter_hop_by_hop, prepare_proxy_request};
use std::sync::Arc;
use url::Url;
use url::form_urlencoded;

pub const DEFAULT_CONTEXT_HEADER: &str = "x-grafana-context";
pub const DEFAULT_USER_HEADER: &str = "x-grafana-user";

/// Explicit director settings. Nothing is read from process wide state.
#[derive(Clone, Debug)]
pub struct DirectorOptions {
    /// Also send the caller login in `user_header`. Upstreams must not treat it as authoritative.
    pub send_user_header: bool,
    /// Carries the JSON serialized caller identity.
    pub context_header: HeaderName,
    pub user_header: HeaderName,
}

impl Default for DirectorOptions {
    fn default() -> Self {
        DirectorOptions {
            send_user_header: false,
            context_header: HeaderName::from_static(DEFAULT_CONTEXT_HEADER),
            user_header: HeaderName::from_static(DEFAULT_USER_HEADER),
        }
    }
}

pub struct Director {
    resolver: Arc<dyn ConfigurationResolver>,
    decryptor: Arc<dyn SecretDecryptor>,
    options: DirectorOptions,
}

impl Director {
    pub fn new(
        resolver: Arc<dyn ConfigurationResolver>,
        decryptor: Arc<dyn SecretDecryptor>,
        options: DirectorOptions,
    ) -> Self {
        Director {
            resolver,
            decryptor,
            options,
        }
    }

    /// Rewrites `req` so it targets the backend of `plugin_id` described by `route`.
    ///
    /// `proxy_path` is the part of the inbound path that follows the route prefix; it is always
    /// appended to the base path of the target in effect. On error `req` is left untouched.
    pub fn direct<B>(
        &self,
        req: &mut Request<B>,
        route: &Route,
        plugin_id: &str,
        proxy_path: &str,
        identity: &CallerIdentity,
    ) -> Result<(), DirectorError> {
        let settings = self.resolver.lookup(identity.org_id, plugin_id)?;
        let secure_json_data = self.decryptor.decrypt(&settings.secure_json_data)?;
        let data = TemplateData::new(&settings.json_data, &secure_json_data);

        // static target first, so there is always a known good fallback
        if route.has_templated_url() {
            return Err(DirectorError::InvalidTarget);
        }
        let mut target = route.url.clone();
        build_uri(&target, proxy_path, req.uri().query(), None)
            .map_err(|_| DirectorError::InvalidTarget)?;

        let mut headers = req.headers().clone();
        headers.remove(COOKIE);
        headers.remove(SET_COOKIE);

        filter_hop_by_hop(&mut headers, req.version());
        let client_ip = req.extensions().get::<ClientAddr>().map(|addr| addr.0.ip());
        let proto = req.uri().scheme_str().unwrap_or("http");
        prepare_proxy_request(&mut headers, client_ip, proto);

        let context = serde_json::to_string(identity)
            .map_err(|e| DirectorError::ContextSerializationFailed(e.to_string()))?;
        let context = HeaderValue::from_str(&context).map_err(|_| {
            DirectorError::ContextSerializationFailed("not a valid header value".to_string())
        })?;
        headers.insert(self.options.context_header.clone(), context);

        self.apply_user_header(&mut headers, identity);

        for spec in &route.headers {
            let header_err = |source| DirectorError::HeaderTemplateError {
                header: spec.name.clone(),
                source,
            };

            let name = HeaderName::from_bytes(spec.name.as_bytes())
                .map_err(|_| header_err(RenderError::InvalidHeaderName))?;
            if name == COOKIE || name == SET_COOKIE {
                tracing::warn!(plugin_id, header = %name, "ignoring cookie header declared by route");
                continue;
            }

            let value = render(&spec.content, &data).map_err(header_err)?;
            let value =
                HeaderValue::from_str(&value).map_err(|_| header_err(RenderError::InvalidHeaderValue))?;
            headers.insert(name, value);
        }

        if let Some(template) = route.dynamic_url() {
            target = render_target(template, &data).map_err(DirectorError::RouteUrlTemplateError)?;
        }

        let mut params = form_urlencoded::Serializer::new(String::new());
        for spec in &route.url_params {
            let value = render(&spec.content, &data).map_err(|source| {
                DirectorError::UrlParamTemplateError {
                    param: spec.name.clone(),
                    source,
                }
            })?;
            params.append_pair(&spec.name, &value);
        }
        let params = params.finish();
        let params = (!params.is_empty()).then_some(params.as_str());

        let uri = build_uri(&target, proxy_path, req.uri().query(), params).map_err(|_| {
            match route.dynamic_url() {
                Some(_) => DirectorError::RouteUrlTemplateError(RenderError::InvalidUri),
                None => DirectorError::InvalidTarget,
            }
        })?;

        if let Some(authority) = uri.authority()
            && let Ok(host) = HeaderValue::from_str(authority.as_str())
        {
            headers.insert(HOST, host);
        }

        tracing::debug!(
            plugin_id,
            host = %target.host_str().unwrap_or_default(),
            path = %uri.path(),
            "directing plugin request"
        );

        *req.uri_mut() = uri;
        *req.headers_mut() = headers;
        Ok(())
    }

    fn apply_user_header(&self, headers: &mut HeaderMap, identity: &CallerIdentity) {
        // never forward a caller supplied value for it
        headers.remove(&self.options.user_header);

        if !self.options.send_user_header || identity.is_anonymous {
            return;
        }

        match HeaderValue::from_str(&identity.login) {
            Ok(login) => {
                headers.insert(self.options.user_header.clone(), login);
            }
            Err(_) => {
                tracing::warn!(user_id = identity.user_id, "login is not a valid header value, skipping user header");
            }
        }
    }
}

fn render(source: &str, data: &TemplateData<'_>) -> Result<String, RenderError> {
    Ok(Template::parse(source)?.render(data)?)
}

fn render_target(source: &str, data: &TemplateData<'_>) -> Result<Url, RenderError> {
    let url = Url::parse(&render(source, data)?)?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(RenderError::UnsupportedUrl);
    }
    Ok(url)
}

/// Builds the outbound request target: scheme and authority of `target`, its path joined with
/// `proxy_path`, then the target query, the inbound query and the rendered url parameters.
fn build_uri(
    target: &Url,
    proxy_path: &str,
    inbound_query: Option<&str>,
    params: Option<&str>,
) -> Result<Uri, http::Error> {
    let host = target.host_str().unwrap_or_default();
    let authority = match target.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    let mut path_and_query = join_url_fragments(target.path(), proxy_path);
    let query: Vec<&str> = [target.query(), inbound_query, params]
        .into_iter()
        .flatten()
        .filter(|q| !q.is_empty())
        .collect();
    if !query.is_empty() {
        path_and_query.push('?');
        path_and_query.push_str(&query.join("&"));
    }

    Uri::builder()
        .scheme(target.scheme())
        .authority(authority)
        .path_and_query(path_and_query)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{AesGcmDecryptor, DecryptError};
    use crate::errors::LookupError;
    use crate::identity::OrgRole;
    use crate::settings::{PluginSettings, ResolveError, StaticSettingsStore};
    use crate::template::TemplateError;
    use secrecy::SecretString;
    use serde_json::json;
    use std::collections::HashMap;

    const PLUGIN: &str = "my-app";

    struct Fixture {
        decryptor: Arc<AesGcmDecryptor>,
        store: StaticSettingsStore,
    }

    impl Fixture {
        fn new() -> Self {
            Fixture {
                decryptor: Arc::new(AesGcmDecryptor::new(&SecretString::from(
                    "test-key".to_string(),
                ))),
                store: StaticSettingsStore::new(),
            }
        }

        fn with_settings(mut self, json_data: serde_json::Value, secrets: &[(&str, &str)]) -> Self {
            let json_data = match json_data {
                serde_json::Value::Object(map) => map,
                _ => panic!("json_data must be an object"),
            };
            let secure_json_data = secrets
                .iter()
                .map(|(k, v)| (k.to_string(), self.decryptor.encrypt(v).unwrap()))
                .collect();
            self.store.insert(
                1,
                PLUGIN,
                PluginSettings {
                    json_data,
                    secure_json_data,
                },
            );
            self
        }

        fn director(&self, options: DirectorOptions) -> Director {
            Director::new(Arc::new(self.store.clone()), self.decryptor.clone(), options)
        }
    }

    fn identity() -> CallerIdentity {
        CallerIdentity {
            user_id: 42,
            org_id: 1,
            org_name: "Main Org.".into(),
            org_role: OrgRole::Editor,
            login: "jdoe".into(),
            email: "jdoe@example.com".into(),
            ..Default::default()
        }
    }

    fn inbound(uri: &str) -> Request<()> {
        Request::builder()
            .uri(uri)
            .header("host", "gateway.local")
            .header("cookie", "session=secret")
            .header("set-cookie", "a=b")
            .header("x-custom", "kept")
            .body(())
            .unwrap()
    }

    fn route(url: &str) -> Route {
        Route::new(Url::parse(url).unwrap())
    }

    #[test]
    fn test_static_target() {
        let director = Fixture::new().with_settings(json!({}), &[]).director(Default::default());
        let mut req = inbound("/api/plugin-proxy/my-app/widgets/1?page=2");

        director
            .direct(&mut req, &route("https://up.example/api"), PLUGIN, "widgets/1", &identity())
            .unwrap();

        assert_eq!(req.uri().to_string(), "https://up.example/api/widgets/1?page=2");
        assert_eq!(req.headers()["host"], "up.example");
        assert_eq!(req.headers()["x-custom"], "kept");
        assert!(req.headers().get("cookie").is_none());
        assert!(req.headers().get("set-cookie").is_none());
        assert_eq!(req.headers()["x-forwarded-proto"], "http");
    }

    #[test]
    fn test_context_header() {
        let director = Fixture::new().with_settings(json!({}), &[]).director(Default::default());
        let mut req = inbound("/x");
        req.headers_mut()
            .insert(DEFAULT_CONTEXT_HEADER, HeaderValue::from_static("{\"forged\":true}"));

        director
            .direct(&mut req, &route("https://up.example"), PLUGIN, "", &identity())
            .unwrap();

        let context = req.headers()[DEFAULT_CONTEXT_HEADER].to_str().unwrap();
        let decoded: CallerIdentity = serde_json::from_str(context).unwrap();
        assert_eq!(decoded, identity());
        assert!(req.headers().get(DEFAULT_USER_HEADER).is_none());
    }

    #[test]
    fn test_user_header() {
        let fixture = Fixture::new().with_settings(json!({}), &[]);
        let director = fixture.director(DirectorOptions {
            send_user_header: true,
            ..Default::default()
        });

        let mut req = inbound("/x");
        director
            .direct(&mut req, &route("https://up.example"), PLUGIN, "", &identity())
            .unwrap();
        assert_eq!(req.headers()[DEFAULT_USER_HEADER], "jdoe");

        // anonymous callers never get one, and an inbound value is dropped
        let mut req = inbound("/x");
        req.headers_mut()
            .insert(DEFAULT_USER_HEADER, HeaderValue::from_static("admin"));
        let anonymous = CallerIdentity {
            is_anonymous: true,
            ..identity()
        };
        director
            .direct(&mut req, &route("https://up.example"), PLUGIN, "", &anonymous)
            .unwrap();
        assert!(req.headers().get(DEFAULT_USER_HEADER).is_none());
    }

    #[test]
    fn test_header_templates() {
        let director = Fixture::new()
            .with_settings(json!({"tenant": "acme", "port": 9000}), &[("token", "abc")])
            .director(Default::default());
        let route = route("https://up.example")
            .with_header("Authorization", "Bearer {{.SecureJsonData.token}}")
            .with_header("X-Tenant", "{{.JsonData.tenant}}-{{.JsonData.port}}")
            .with_header("X-Custom", "overridden")
            .with_header("X-Custom", "last wins");

        let mut req = inbound("/x");
        director
            .direct(&mut req, &route, PLUGIN, "", &identity())
            .unwrap();

        assert_eq!(req.headers()["authorization"], "Bearer abc");
        assert_eq!(req.headers()["x-tenant"], "acme-9000");
        assert_eq!(req.headers()["x-custom"], "last wins");
    }

    #[test]
    fn test_missing_secret_aborts_without_mutation() {
        let director = Fixture::new().with_settings(json!({}), &[]).director(Default::default());
        let route = route("https://up.example/api")
            .with_header("X-First", "set before the failure")
            .with_header("Authorization", "Bearer {{.SecureJsonData.token}}");

        let mut req = inbound("/api/plugin-proxy/my-app/widgets");
        let before_uri = req.uri().clone();
        let before_headers = req.headers().clone();

        let err = director
            .direct(&mut req, &route, PLUGIN, "widgets", &identity())
            .unwrap_err();

        assert!(matches!(
            err,
            DirectorError::HeaderTemplateError {
                ref header,
                source: RenderError::Template(TemplateError::MissingValue(_)),
            } if header == "Authorization"
        ));
        assert_eq!(req.uri(), &before_uri);
        assert_eq!(req.headers(), &before_headers);
    }

    #[test]
    fn test_cookie_header_from_route_is_ignored() {
        let director = Fixture::new().with_settings(json!({}), &[]).director(Default::default());
        let route = route("https://up.example")
            .with_header("Cookie", "injected=1")
            .with_header("Set-Cookie", "injected=1");

        let mut req = inbound("/x");
        director
            .direct(&mut req, &route, PLUGIN, "", &identity())
            .unwrap();

        assert!(req.headers().get("cookie").is_none());
        assert!(req.headers().get("set-cookie").is_none());
    }

    #[test]
    fn test_dynamic_url() {
        let director = Fixture::new()
            .with_settings(json!({"region": "eu"}), &[])
            .director(Default::default());
        let route = route("https://up.example/api")
            .with_dynamic_url("https://{{.JsonData.region}}.up.example:8443/v2/");

        let mut req = inbound("/api/plugin-proxy/my-app/widgets/1");
        director
            .direct(&mut req, &route, PLUGIN, "widgets/1", &identity())
            .unwrap();

        assert_eq!(req.uri().to_string(), "https://eu.up.example:8443/v2/widgets/1");
        assert_eq!(req.headers()["host"], "eu.up.example:8443");
    }

    #[test]
    fn test_broken_dynamic_url_is_not_masked() {
        let director = Fixture::new()
            .with_settings(json!({"region": "not a host"}), &[])
            .director(Default::default());

        let route_with = |template: &str| route("https://up.example/api").with_dynamic_url(template);

        for template in [
            "https://{{.JsonData.region}}/api",
            "{{.JsonData.region}}",
            "https://{{.JsonData.missing}}.example",
            "https://{{.JsonData.region",
        ] {
            let mut req = inbound("/x");
            let err = director
                .direct(&mut req, &route_with(template), PLUGIN, "x", &identity())
                .unwrap_err();
            assert!(
                matches!(err, DirectorError::RouteUrlTemplateError(_)),
                "{template}: {err:?}"
            );
            assert_eq!(req.uri(), "/x");
        }
    }

    #[test]
    fn test_url_params() {
        let director = Fixture::new()
            .with_settings(json!({"format": "json"}), &[("key", "a&b=c")])
            .director(Default::default());
        let route = route("https://up.example/api?v=1")
            .with_url_param("api_key", "{{.SecureJsonData.key}}")
            .with_url_param("format", "{{.JsonData.format}}");

        let mut req = inbound("/x?page=2");
        director
            .direct(&mut req, &route, PLUGIN, "items", &identity())
            .unwrap();

        assert_eq!(
            req.uri().to_string(),
            "https://up.example/api/items?v=1&page=2&api_key=a%26b%3Dc&format=json"
        );

        let route = self::route("https://up.example").with_url_param("x", "{{.JsonData.nope}}");
        let mut req = inbound("/x");
        let err = director
            .direct(&mut req, &route, PLUGIN, "", &identity())
            .unwrap_err();
        assert!(matches!(err, DirectorError::UrlParamTemplateError { ref param, .. } if param == "x"));
    }

    #[test]
    fn test_unknown_settings() {
        let director = Fixture::new().director(Default::default());
        let mut req = inbound("/x");

        let err = director
            .direct(&mut req, &route("https://up.example"), PLUGIN, "", &identity())
            .unwrap_err();
        assert!(matches!(
            err,
            DirectorError::ConfigurationLookupFailed(LookupError::Resolve(ResolveError::NotFound { .. }))
        ));
        assert!(req.headers().get("cookie").is_some(), "request untouched");
    }

    struct FailingResolver;

    impl ConfigurationResolver for FailingResolver {
        fn lookup(&self, _org_id: i64, _plugin_id: &str) -> Result<PluginSettings, ResolveError> {
            Err(ResolveError::Backend("connection refused".to_string()))
        }
    }

    #[test]
    fn test_settings_backend_failure() {
        let director = Director::new(
            Arc::new(FailingResolver),
            Fixture::new().decryptor,
            Default::default(),
        );
        let mut req = inbound("/x");

        let err = director
            .direct(&mut req, &route("https://up.example"), PLUGIN, "", &identity())
            .unwrap_err();
        assert!(matches!(
            err,
            DirectorError::ConfigurationLookupFailed(LookupError::Resolve(ResolveError::Backend(_)))
        ));
        assert_eq!(err.kind(), "configuration_lookup_failed");
        assert!(req.headers().get("cookie").is_some(), "request untouched");
    }

    #[test]
    fn test_templated_static_url_is_not_forwarded() {
        let director = Fixture::new()
            .with_settings(json!({"host": "up.example", "tenant": "acme"}), &[])
            .director(Default::default());

        for url in [
            "https://{{.JsonData.host}}/api",
            "https://up.example/{{.JsonData.tenant}}",
        ] {
            let mut req = inbound("/api/plugin-proxy/my-app/w");
            let err = director
                .direct(&mut req, &route(url), PLUGIN, "w", &identity())
                .unwrap_err();
            assert!(matches!(err, DirectorError::InvalidTarget), "{url}");
            assert_eq!(req.uri().path(), "/api/plugin-proxy/my-app/w", "{url}");
        }
    }

    #[test]
    fn test_undecryptable_secret() {
        let mut fixture = Fixture::new();
        fixture.store.insert(
            1,
            PLUGIN,
            PluginSettings {
                json_data: Default::default(),
                secure_json_data: HashMap::from([("token".to_string(), "garbage".to_string())]),
            },
        );
        let director = fixture.director(Default::default());

        let mut req = inbound("/x");
        let err = director
            .direct(&mut req, &route("https://up.example"), PLUGIN, "", &identity())
            .unwrap_err();
        assert!(matches!(
            err,
            DirectorError::ConfigurationLookupFailed(LookupError::Decrypt(DecryptError::InvalidEncoding(_)))
        ));
    }

    #[test]
    fn test_path_suffix_is_preserved() {
        let director = Fixture::new()
            .with_settings(json!({"base": "https://dyn.example/base"}), &[])
            .director(Default::default());

        for suffix in ["", "a", "a/b/c", "a/b/", "with%20space"] {
            for route in [
                route("https://up.example/root"),
                route("https://up.example/root").with_dynamic_url("{{.JsonData.base}}"),
            ] {
                let mut req = inbound("/x");
                director
                    .direct(&mut req, &route, PLUGIN, suffix, &identity())
                    .unwrap();

                let base = match route.dynamic_url() {
                    Some(_) => "/base",
                    None => "/root",
                };
                assert_eq!(req.uri().path(), join_url_fragments(base, suffix));
            }
        }
    }

    #[test]
    fn test_forwarded_for() {
        let director = Fixture::new().with_settings(json!({}), &[]).director(Default::default());
        let mut req = inbound("/x");
        req.extensions_mut()
            .insert(ClientAddr("10.1.2.3:5555".parse().unwrap()));

        director
            .direct(&mut req, &route("https://up.example"), PLUGIN, "", &identity())
            .unwrap();
        assert_eq!(req.headers()["x-forwarded-for"], "10.1.2.3");
    }

    #[test]
    fn test_secrets_not_in_errors() {
        let director = Fixture::new()
            .with_settings(json!({}), &[("token", "line\nbreak")])
            .director(Default::default());
        let route = route("https://up.example").with_header("X-Token", "{{.SecureJsonData.token}}");

        let mut req = inbound("/x");
        let err = director
            .direct(&mut req, &route, PLUGIN, "", &identity())
            .unwrap_err();
        assert!(matches!(
            err,
            DirectorError::HeaderTemplateError {
                source: RenderError::InvalidHeaderValue,
                ..
            }
        ));
        assert!(!err.to_string().contains("line"));
    }
}
