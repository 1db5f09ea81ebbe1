//! The RPC front end.
//!
//! Every operation of the [`SigningService`] is offered as a `POST` of a
//! JSON body to `/rpc/v1/<operation>`. The front end only parses requests,
//! checks the bearer token and renders results or faults. All state lives
//! in the service.

pub mod dispatch;
pub mod request;
pub mod response;
pub mod runtime;
pub mod scheduler;
pub mod start;

use std::convert::Infallible;
use std::sync::Arc;
use log::{debug, info, warn};
use crate::commons::SignerResult;
use crate::config::Config;
use crate::service::SigningService;
use self::dispatch::{DispatchError, dispatch_request};
use self::request::{BodyLimits, HyperRequest, Request};
use self::response::{HttpResponse, HyperResponse};
use self::runtime::{RunError, SignerRuntime};


//------------ HttpServer ----------------------------------------------------

pub struct HttpServer {
    service: Arc<SigningService>,
    runtime: SignerRuntime,
    auth_token: Option<String>,
    limits: BodyLimits,
}

impl HttpServer {
    /// Creates a server for the service.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(service: Arc<SigningService>, config: &Config) -> Self {
        HttpServer {
            service,
            runtime: SignerRuntime::current(
                config.request_timeout(), config.worker_threads
            ),
            auth_token: config.auth_token.clone(),
            limits: BodyLimits::from_config(config),
        }
    }

    pub fn service(&self) -> &Arc<SigningService> {
        &self.service
    }

    pub fn auth_token(&self) -> Option<&str> {
        self.auth_token.as_deref()
    }

    pub fn limits(&self) -> BodyLimits {
        self.limits
    }

    /// Runs a service operation on the blocking thread pool.
    pub async fn run<F, T>(&self, op: F) -> Result<T, RunError>
    where
        F: FnOnce(&SigningService) -> SignerResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let service = self.service.clone();
        self.runtime.run(move || op(&service)).await
    }

    pub async fn process_request(
        &self, request: HyperRequest
    ) -> Result<HyperResponse, Infallible> {
        let request = Request::new(request, self);
        let path = request.path();
        let response = match dispatch_request(request, path.iter()).await {
            Ok(response) => response,
            Err(DispatchError(response)) => response,
        };
        Self::log_response(path.as_str(), &response);
        Ok(response.into_hyper())
    }

    fn log_response(path: &str, response: &HttpResponse) {
        let status = response.status();
        match response.cause() {
            Some(err) if status.is_server_error() => {
                warn!("{path}: {} {err}", status.as_u16());
            }
            Some(err) => {
                info!("{path}: {} {err}", status.as_u16());
            }
            None => {
                debug!("{path}: {}", status.as_u16());
            }
        }
    }
}
