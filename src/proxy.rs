//! Request proxy from the dev server to the backend process
//!
//! Requests are forwarded with their method, path, query, headers and body
//! stream intact; the response streams back unchanged. Only the `Host` header
//! follows the target so the backend sees its own address.

use crate::error::{json_error_response, ProxyErrorCode};
use http_body_util::combinators::BoxBody;
use http_body_util::BodyExt;
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, error};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("{}", error_chain(.0))]
    Client(#[from] hyper_util::client::legacy::Error),

    #[error("Request build error: {0}")]
    RequestBuild(#[from] http::Error),
}

/// Render an error with all of its sources, e.g.
/// `client error (Connect): tcp connect error: Connection refused (os error 111)`.
/// Sources already spelled out by an outer message are not repeated.
fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !out.contains(&text) {
            out.push_str(": ");
            out.push_str(&text);
        }
        source = cause.source();
    }
    out
}

pub struct BackendProxy {
    client: Client<HttpConnector, Incoming>,
    /// Backend origin, e.g. `http://localhost:3001`
    target: String,
}

impl BackendProxy {
    pub fn new(target: impl Into<String>) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new()).build(connector);

        Self {
            client,
            target: target.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Resolve a request URI against the backend origin
    pub fn resolve(&self, uri: &Uri) -> String {
        let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        format!("{}{}", self.target, path)
    }

    /// Forward a request and return the backend's response, or a 500 carrying
    /// the failure detail.
    pub async fn forward(&self, req: Request<Incoming>) -> Response<BoxBody<Bytes, hyper::Error>> {
        let request_id = Uuid::new_v4();
        let target_url = self.resolve(req.uri());
        debug!(%request_id, method = %req.method(), url = %target_url, "Proxying request");

        match self.send(req, &target_url).await {
            Ok(response) => {
                debug!(%request_id, status = %response.status(), "Backend responded");
                response
            }
            Err(e) => {
                error!(
                    %request_id,
                    error = %e,
                    "Problems with proxy. Make sure API is running on {}",
                    self.target
                );
                json_error_response(ProxyErrorCode::ProxyFailed, e.to_string())
            }
        }
    }

    async fn send(
        &self,
        req: Request<Incoming>,
        target_url: &str,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ProxyError> {
        let (parts, body) = req.into_parts();
        let mut builder = Request::builder()
            .method(parts.method)
            .uri(target_url);

        for (key, value) in parts.headers.iter() {
            if key == hyper::header::HOST {
                continue;
            }
            builder = builder.header(key, value);
        }

        let backend_req = builder.body(body)?;
        let response = self.client.request(backend_req).await?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_preserves_path_and_query() {
        let proxy = BackendProxy::new("http://localhost:3001");
        let uri: Uri = "/api/users?page=2".parse().unwrap();
        assert_eq!(proxy.resolve(&uri), "http://localhost:3001/api/users?page=2");
    }

    #[test]
    fn test_resolve_root_and_absolute_form() {
        let proxy = BackendProxy::new("http://localhost:3001/");
        assert_eq!(proxy.target(), "http://localhost:3001");

        let root: Uri = "/".parse().unwrap();
        assert_eq!(proxy.resolve(&root), "http://localhost:3001/");

        let absolute: Uri = "http://localhost:3000/anything".parse().unwrap();
        assert_eq!(proxy.resolve(&absolute), "http://localhost:3001/anything");
    }

    #[test]
    fn test_error_chain_includes_sources() {
        let inner = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let outer = crate::error::DevError::Io(inner);
        assert_eq!(error_chain(&outer), "refused");

        let spawn = crate::error::DevError::Spawn {
            command: "node".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        };
        assert_eq!(error_chain(&spawn), "Failed to spawn backend 'node': missing");
    }

    #[derive(Debug, thiserror::Error)]
    #[error("request failed")]
    struct Opaque(#[source] std::io::Error);

    #[test]
    fn test_error_chain_appends_unmentioned_sources() {
        let err = Opaque(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"));
        assert_eq!(error_chain(&err), "request failed: refused");
    }
}
