//! Tower layer for rate limiting in Axum.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::{
    body::Body,
    http::{HeaderMap, Request, Response, StatusCode},
};
use tower::{Layer, Service};

use crate::algorithm::Algorithm;
use crate::decision::Decision;
use crate::key::{HasHeaders, HasIpAddr, HasMethod, HasPath, Key};
use crate::quota::Quota;
use crate::storage::Storage;

#[cfg(feature = "composer")]
use super::pipeline::{MiddlewareConfig, RenderedResponse, Verdict};

/// Tower layer for rate limiting.
// derive(Clone) removed to allow S to be ?Clone

pub struct RateLimitLayer<S, A, K> {
    storage: Arc<S>,
    algorithm: A,
    quota: Quota,
    key_extractor: K,
}

impl<S, A, K> RateLimitLayer<S, A, K> {
    /// Create a new rate limit layer.
    pub fn new(storage: S, algorithm: A, quota: Quota, key_extractor: K) -> Self {
        Self {
            storage: Arc::new(storage),
            algorithm,
            quota,
            key_extractor,
        }
    }
}

impl<S, A, K> Clone for RateLimitLayer<S, A, K>
where
    A: Clone,
    K: Clone,
{
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            algorithm: self.algorithm.clone(),
            quota: self.quota.clone(),
            key_extractor: self.key_extractor.clone(),
        }
    }
}

impl<S, A, K, Inner> Layer<Inner> for RateLimitLayer<S, A, K>
where
    A: Clone,
    K: Clone,
{
    type Service = RateLimitService<S, A, K, Inner>;

    fn layer(&self, inner: Inner) -> Self::Service {
        RateLimitService {
            inner,
            storage: self.storage.clone(),
            algorithm: self.algorithm.clone(),
            quota: self.quota.clone(),
            key_extractor: self.key_extractor.clone(),
        }
    }
}

/// The rate limiting service.
// derive(Clone) removed to allow S to be ?Clone

pub struct RateLimitService<S, A, K, Inner> {
    inner: Inner,
    storage: Arc<S>,
    algorithm: A,
    quota: Quota,
    key_extractor: K,
}

impl<S, A, K, Inner> Clone for RateLimitService<S, A, K, Inner>
where
    A: Clone,
    K: Clone,
    Inner: Clone,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            storage: self.storage.clone(),
            algorithm: self.algorithm.clone(),
            quota: self.quota.clone(),
            key_extractor: self.key_extractor.clone(),
        }
    }
}

/// Owned snapshot of the parts of an Axum request needed for key extraction
/// and rule evaluation. Owning rather than borrowing lets it cross `.await`
/// points and satisfy the `'static` bound `Key`/`Rule` require.
pub struct AxumRequestParts {
    method: String,
    path: String,
    headers: HeaderMap,
}

impl AxumRequestParts {
    fn from_request(request: &Request<Body>) -> Self {
        Self {
            method: request.method().as_str().to_string(),
            path: request.uri().path().to_string(),
            headers: request.headers().clone(),
        }
    }
}

impl HasPath for AxumRequestParts {
    fn path(&self) -> &str {
        &self.path
    }
}

impl HasMethod for AxumRequestParts {
    fn method(&self) -> &str {
        &self.method
    }
}

impl HasHeaders for AxumRequestParts {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

impl HasIpAddr for AxumRequestParts {
    #[allow(clippy::collapsible_if)]
    fn client_ip(&self) -> Option<std::net::IpAddr> {
        if let Some(forwarded) = self.header("x-forwarded-for") {
            if let Ok(ip) = forwarded.split(',').next()?.trim().parse() {
                return Some(ip);
            }
        }
        if let Some(real_ip) = self.header("x-real-ip") {
            if let Ok(ip) = real_ip.parse() {
                return Some(ip);
            }
        }
        None
    }
}

impl<S, A, K, Inner> Service<Request<Body>> for RateLimitService<S, A, K, Inner>
where
    S: Storage + Send + Sync + 'static,
    A: Algorithm + Clone + Send + Sync + 'static,
    K: Key<AxumRequestParts> + Clone + Send + Sync + 'static,
    Inner: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    Inner::Future: Send,
{
    type Response = Response<Body>;
    type Error = Inner::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let storage = self.storage.clone();
        let algorithm = self.algorithm.clone();
        let quota = self.quota.clone();
        let key_extractor = self.key_extractor.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let parts = AxumRequestParts::from_request(&request);
            let key = key_extractor
                .extract(&parts)
                .unwrap_or_else(|| format!("axum:{}", parts.path()));

            let decision = algorithm
                .check_and_record(&*storage, &key, &quota)
                .await
                .unwrap_or_else(|_| {
                    // On error, allow the request (fail open)
                    Decision::allowed(crate::decision::RateLimitInfo::new(
                        quota.max_requests(),
                        quota.max_requests(),
                        std::time::Instant::now() + quota.window(),
                        std::time::Instant::now(),
                    ))
                });

            if decision.is_allowed() {
                // Add rate limit headers and proceed
                let response = inner.call(request).await?;
                Ok(add_rate_limit_headers(response, &decision))
            } else {
                // Return 429 Too Many Requests
                Ok(rate_limited_response(&decision))
            }
        })
    }
}

/// Add rate limit headers to a response.
fn add_rate_limit_headers(mut response: Response<Body>, decision: &Decision) -> Response<Body> {
    let headers = response.headers_mut();
    for (name, value) in decision.info().to_headers() {
        if let Ok(header_value) = value.parse() {
            headers.insert(name, header_value);
        }
    }
    response
}

/// Create a 429 Too Many Requests response.
fn rate_limited_response(decision: &Decision) -> Response<Body> {
    let info = decision.info();
    let retry_after = info
        .retry_after
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|| "60".to_string());

    let body = format!(
        r#"{{"error":"Too Many Requests","retry_after":{},"remaining":{},"limit":{}}}"#,
        retry_after, info.remaining, info.limit
    );

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;

    let headers = response.headers_mut();
    headers.insert("content-type", "application/json".parse().unwrap());

    for (name, value) in info.to_headers() {
        if let Ok(header_value) = value.parse() {
            headers.insert(name, header_value);
        }
    }

    response
}

/// Tower layer that runs a full [`MiddlewareConfig`] pipeline (safelists,
/// blocklists, fail2bans, allow2bans, throttles, trackers) in front of an
/// Axum service, instead of a single fixed algorithm/quota/key.
#[cfg(feature = "composer")]
pub struct PipelineLayer<S> {
    storage: Arc<S>,
    config: Arc<MiddlewareConfig<AxumRequestParts>>,
}

#[cfg(feature = "composer")]
impl<S> PipelineLayer<S> {
    /// Create a new pipeline layer from storage and a built configuration.
    pub fn new(storage: S, config: MiddlewareConfig<AxumRequestParts>) -> Self {
        Self {
            storage: Arc::new(storage),
            config: Arc::new(config),
        }
    }
}

#[cfg(feature = "composer")]
impl<S> Clone for PipelineLayer<S> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            config: self.config.clone(),
        }
    }
}

#[cfg(feature = "composer")]
impl<S, Inner> Layer<Inner> for PipelineLayer<S> {
    type Service = PipelineService<S, Inner>;

    fn layer(&self, inner: Inner) -> Self::Service {
        PipelineService {
            inner,
            storage: self.storage.clone(),
            config: self.config.clone(),
        }
    }
}

#[cfg(feature = "composer")]
pub struct PipelineService<S, Inner> {
    inner: Inner,
    storage: Arc<S>,
    config: Arc<MiddlewareConfig<AxumRequestParts>>,
}

#[cfg(feature = "composer")]
impl<S, Inner: Clone> Clone for PipelineService<S, Inner> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            storage: self.storage.clone(),
            config: self.config.clone(),
        }
    }
}

/// Marker stashed in request extensions for the re-entry guard (step 1 of
/// the pipeline's evaluation order).
#[cfg(feature = "composer")]
#[derive(Clone, Copy)]
struct PipelineEntered;

#[cfg(feature = "composer")]
impl<S, Inner> Service<Request<Body>> for PipelineService<S, Inner>
where
    S: Storage + Send + Sync + 'static,
    Inner: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    Inner::Future: Send,
{
    type Response = Response<Body>;
    type Error = Inner::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<Body>) -> Self::Future {
        let storage = self.storage.clone();
        let config = self.config.clone();
        let mut inner = self.inner.clone();

        let entered = request.extensions().get::<PipelineEntered>().is_some();
        if !entered {
            request.extensions_mut().insert(PipelineEntered);
        }

        Box::pin(async move {
            let parts = AxumRequestParts::from_request(&request);

            match config.evaluate(&parts, &*storage, entered).await {
                Ok(Verdict::Allow) => inner.call(request).await,
                Ok(Verdict::Block(rendered)) | Ok(Verdict::Throttle(rendered)) => {
                    Ok(render_response(rendered))
                }
                Err(_) => inner.call(request).await,
            }
        })
    }
}

#[cfg(feature = "composer")]
fn render_response(rendered: RenderedResponse) -> Response<Body> {
    let status = StatusCode::from_u16(rendered.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = Response::new(Body::from(rendered.body));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    for (name, value) in &rendered.headers {
        if let (Ok(header_name), Ok(header_value)) = (
            axum::http::HeaderName::try_from(name.as_str()),
            value.parse(),
        ) {
            headers.insert(header_name, header_value);
        }
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layer_creation() {
        use crate::key::GlobalKey;
        use crate::storage::MemoryStorage;
        use crate::algorithm::GCRA;

        let storage = MemoryStorage::new();
        let layer = RateLimitLayer::new(
            storage,
            GCRA::new(),
            Quota::per_second(10),
            GlobalKey::new(),
        );

        // Just verify it compiles
        assert_eq!(layer.quota.max_requests(), 10);
    }

    #[cfg(feature = "composer")]
    #[tokio::test]
    async fn test_pipeline_layer_blocks_ip() {
        use crate::storage::MemoryStorage;
        use std::net::{IpAddr, Ipv4Addr};
        use tower::ServiceExt;

        let config: MiddlewareConfig<AxumRequestParts> =
            MiddlewareConfig::new().blocklist_ip("banned", [IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9))]);
        let layer = PipelineLayer::new(MemoryStorage::new(), config);

        let inner = tower::service_fn(|_req: Request<Body>| async {
            Ok::<_, std::convert::Infallible>(Response::new(Body::from("ok")))
        });
        let mut service = layer.layer(inner);

        let request = Request::builder()
            .uri("/data")
            .header("x-real-ip", "9.9.9.9")
            .body(Body::empty())
            .unwrap();

        let response = service.ready().await.unwrap().call(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
