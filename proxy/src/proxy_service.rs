use crate::auth::Authenticator;
use crate::director::Director;
use crate::errors::ProxyError;
use crate::metrics_defs::{DIRECTOR_FAILURES, REQUEST_DURATION, REQUESTS_INFLIGHT};
use crate::route::RouteTable;
use bytes::Bytes;
use http::header::SET_COOKIE;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Incoming};
use hyper::service::Service as HyperService;
use hyper::{Request, Response, StatusCode};
use shared::http::{add_via_header, filter_hop_by_hop, make_error_response};
use shared::path::PathPattern;
use shared::{counter, gauge, histogram};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, timeout_at};

const PROXY_PATH_PATTERN: &str = "/api/plugin-proxy/{plugin_id}/*";

type ProxyResponse = Response<BoxBody<Bytes, ProxyError>>;

/// Limits applied to every forwarded request.
#[derive(Clone, Copy, Debug)]
pub struct ForwardOptions {
    /// Deadline for directing and forwarding, upstream response body included.
    pub upstream_timeout: Duration,
    pub max_body_bytes: usize,
}

/// Serves `/api/plugin-proxy/{plugin_id}/{path}`: authenticates the caller, selects the plugin
/// route, runs the [`Director`] and forwards the rewritten request to the plugin backend.
#[derive(Clone)]
pub struct PluginProxyService {
    prefix: Arc<PathPattern>,
    routes: Arc<RouteTable>,
    director: Arc<Director>,
    authenticator: Arc<dyn Authenticator>,
    client: reqwest::Client,
    options: ForwardOptions,
}

impl PluginProxyService {
    pub fn new(
        routes: RouteTable,
        director: Director,
        authenticator: Arc<dyn Authenticator>,
        options: ForwardOptions,
    ) -> Result<Self, ProxyError> {
        // the upstream's redirects are the caller's business, not ours
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            prefix: Arc::new(PathPattern::parse(PROXY_PATH_PATTERN)),
            routes: Arc::new(routes),
            director: Arc::new(director),
            authenticator,
            client,
            options,
        })
    }

    pub async fn handle<B>(&self, req: Request<B>) -> ProxyResponse
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let start = Instant::now();
        let _inflight = InflightGuard::new();

        let response = self.dispatch(req, start + self.options.upstream_timeout).await;

        histogram!(REQUEST_DURATION, "status" => response.status().as_u16().to_string())
            .record(start.elapsed().as_secs_f64());
        response
    }

    async fn dispatch<B>(&self, req: Request<B>, deadline: Instant) -> ProxyResponse
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (mut parts, body) = req.into_parts();

        let Some(matched) = self.prefix.matches(parts.uri.path()) else {
            return make_error_response(StatusCode::NOT_FOUND);
        };
        let plugin_id = matched.params["plugin_id"].to_string();
        let rest = matched.rest.to_string();

        let Some(identity) = self.authenticator.authenticate(&parts) else {
            return make_error_response(StatusCode::UNAUTHORIZED);
        };
        self.authenticator.strip_credentials(&mut parts.headers);

        if has_dot_dot_segment(&rest) {
            tracing::warn!(%plugin_id, "rejecting proxy path with dot segments");
            return make_error_response(StatusCode::BAD_REQUEST);
        }

        let Some(route_match) = self.routes.find(&plugin_id, &rest, &parts.method) else {
            tracing::debug!(
                %plugin_id,
                known_plugin = self.routes.has_plugin(&plugin_id),
                method = %parts.method,
                "no plugin route matched"
            );
            return make_error_response(StatusCode::NOT_FOUND);
        };

        if let Some(required) = route_match.route.req_role
            && !identity.has_role(required)
        {
            return make_error_response(StatusCode::FORBIDDEN);
        }

        let body = match Limited::new(body, self.options.max_body_bytes).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
                return make_error_response(StatusCode::PAYLOAD_TOO_LARGE);
            }
            Err(e) => {
                tracing::debug!(error = %e, "failed to read request body");
                return make_error_response(StatusCode::BAD_REQUEST);
            }
        };
        let mut req = Request::from_parts(parts, body);

        // settings lookup and decryption are blocking calls
        let director = self.director.clone();
        let task_plugin_id = plugin_id.clone();
        let directed = timeout_at(
            deadline,
            tokio::task::spawn_blocking(move || {
                director
                    .direct(
                        &mut req,
                        &route_match.route,
                        &task_plugin_id,
                        &route_match.proxy_path,
                        &identity,
                    )
                    .map(|()| req)
            }),
        )
        .await;

        let req = match directed {
            Ok(Ok(Ok(req))) => req,
            Ok(Ok(Err(e))) => {
                tracing::error!(%plugin_id, kind = e.kind(), error = %e, "failed to direct plugin request");
                counter!(DIRECTOR_FAILURES, "kind" => e.kind()).increment(1);
                return make_error_response(StatusCode::INTERNAL_SERVER_ERROR);
            }
            Ok(Err(e)) => {
                tracing::error!(%plugin_id, error = %e, "director task failed");
                return make_error_response(StatusCode::INTERNAL_SERVER_ERROR);
            }
            Err(_) => {
                tracing::warn!(%plugin_id, "deadline exceeded before forwarding");
                return make_error_response(StatusCode::GATEWAY_TIMEOUT);
            }
        };

        self.forward(req, deadline, &plugin_id).await
    }

    async fn forward(&self, req: Request<Bytes>, deadline: Instant, plugin_id: &str) -> ProxyResponse {
        let (parts, body) = req.into_parts();
        let upstream = self
            .client
            .request(parts.method, parts.uri.to_string())
            .headers(parts.headers)
            .body(body);

        let result = timeout_at(deadline, async {
            let response = upstream.send().await?;
            let status = response.status();
            let version = response.version();
            let headers = response.headers().clone();
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>((status, version, headers, body))
        })
        .await;

        match result {
            Ok(Ok((status, version, mut headers, body))) => {
                filter_hop_by_hop(&mut headers, version);
                add_via_header(&mut headers, version);
                headers.remove(SET_COOKIE);

                let mut response = Response::new(Full::new(body).map_err(|e| match e {}).boxed());
                *response.status_mut() = status;
                *response.headers_mut() = headers;
                response
            }
            Ok(Err(e)) => {
                // the url can carry rendered secrets in its query
                tracing::warn!(%plugin_id, error = %e.without_url(), "plugin upstream request failed");
                make_error_response(StatusCode::BAD_GATEWAY)
            }
            Err(_) => {
                tracing::warn!(%plugin_id, "plugin upstream timed out");
                make_error_response(StatusCode::GATEWAY_TIMEOUT)
            }
        }
    }
}

/// Counts a request in `requests.inflight` until dropped, including when hyper drops the
/// request future because the client went away.
struct InflightGuard;

impl InflightGuard {
    fn new() -> Self {
        gauge!(REQUESTS_INFLIGHT).increment(1.0);
        InflightGuard
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        gauge!(REQUESTS_INFLIGHT).decrement(1.0);
    }
}

/// True if any segment of the path is `..`, percent-encoded or not.
fn has_dot_dot_segment(path: &str) -> bool {
    path.split('/')
        .any(|segment| segment.to_ascii_lowercase().replace("%2e", ".") == "..")
}

impl HyperService<Request<Incoming>> for PluginProxyService {
    type Response = ProxyResponse;
    type Error = ProxyError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let service = self.clone();
        Box::pin(async move { Ok(service.handle(req).await) })
    }
}
