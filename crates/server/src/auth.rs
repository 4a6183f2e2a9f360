//! API key authentication.

use std::{
    fmt::Display,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use axum::body::Body;
use http::{Request, Response};
use llm::Gateway;
use tower::Layer;

/// Authenticates requests against the current snapshot and attaches a [`llm::RequestContext`].
///
/// Unknown or missing keys are answered with 401 in the client's error format and never reach
/// the pipeline.
#[derive(Clone)]
pub struct AuthLayer(Arc<Gateway>);

impl AuthLayer {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self(gateway)
    }
}

impl<Service> Layer<Service> for AuthLayer
where
    Service: Send + Clone,
{
    type Service = AuthService<Service>;

    fn layer(&self, next: Service) -> Self::Service {
        AuthService {
            next,
            gateway: self.0.clone(),
        }
    }
}

#[derive(Clone)]
pub struct AuthService<Service> {
    next: Service,
    gateway: Arc<Gateway>,
}

impl<Service, ReqBody> tower::Service<Request<ReqBody>> for AuthService<Service>
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

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        let mut next = self.next.clone();

        let context = self.gateway.authenticate(llm::extract_api_key(req.headers()));

        Box::pin(async move {
            match context {
                Ok(context) => {
                    log::debug!("Authenticated request as credential '{}'", context.credential.id);

                    req.extensions_mut().insert(context);
                    next.call(req).await
                }
                Err(error) => Ok(error.into_client_response(llm::client_format(req.uri().path()))),
            }
        })
    }
}

