//! Per-credential rate limiting middleware.

use std::{
    fmt::Display,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use axum::body::Body;
use http::{Request, Response};
use llm::{Gateway, RequestContext};
use tower::Layer;

/// Takes one token from the authenticated credential's bucket before the pipeline runs.
///
/// Must sit inside [`crate::auth::AuthLayer`]. Token counting is exempt.
#[derive(Clone)]
pub struct RateLimitLayer(Arc<Gateway>);

impl RateLimitLayer {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self(gateway)
    }
}

impl<Service> Layer<Service> for RateLimitLayer
where
    Service: Send + Clone,
{
    type Service = RateLimitService<Service>;

    fn layer(&self, next: Service) -> Self::Service {
        RateLimitService {
            next,
            gateway: self.0.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitService<Service> {
    next: Service,
    gateway: Arc<Gateway>,
}

impl<Service, ReqBody> tower::Service<Request<ReqBody>> for RateLimitService<Service>
where
    Service: tower::Service<Request<ReqBody>, Response = Response<Body>> + Send + Clone + 'static,
    Service::Future: Send,
    Service::Error: Display + 'static,
    ReqBody: http_body::Body + Send + 'static,
{
    type Response = http::Response<Body>;
    type Error = Service::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Response<Body>, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.next.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let mut next = self.next.clone();

        let path = req.uri().path();
        let exempt = path == llm::COUNT_TOKENS_PATH;

        let admission = match req.extensions().get::<RequestContext>() {
            Some(context) if !exempt => self.gateway.check_rate_limit(context),
            _ => Ok(()),
        };

        let format = llm::client_format(path);

        Box::pin(async move {
            match admission {
                Ok(()) => next.call(req).await,
                Err(error) => Ok(error.into_client_response(format)),
            }
        })
    }
}
