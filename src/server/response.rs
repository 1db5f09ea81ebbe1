//! HTTP responses of the RPC front end.

use bytes::Bytes;
use http_body_util::{Either, Empty, Full};
use hyper::StatusCode;
use hyper::header::{CONTENT_TYPE, HeaderValue, WWW_AUTHENTICATE};
use serde::Serialize;
use crate::api::fault::Fault;
use crate::commons::error::Error;


//----------- ContentType ----------------------------------------------------

#[derive(Clone, Copy)]
enum ContentType {
    Json,
    Text,
}

impl ContentType {
    fn as_str(&self) -> &'static str {
        match self {
            ContentType::Json => "application/json",
            ContentType::Text => "text/plain",
        }
    }
}


//------------ HyperResponse -------------------------------------------------

pub type HyperResponseBody = Either<Empty<Bytes>, Full<Bytes>>;
pub type HyperResponse = hyper::Response<HyperResponseBody>;


//----------- Response -------------------------------------------------------

struct Response {
    status: StatusCode,
    content_type: ContentType,
    body: Bytes,
    cause: Option<Error>,
}

impl Response {
    fn new(status: StatusCode) -> Self {
        Response {
            status,
            content_type: ContentType::Text,
            body: Bytes::default(),
            cause: None,
        }
    }

    fn finalize(self) -> HttpResponse {
        let body = if self.body.is_empty() {
            Either::Left(Empty::new())
        } else {
            Either::Right(Full::new(self.body))
        };
        let mut response = hyper::Response::new(body);
        *response.status_mut() = self.status;
        response.headers_mut().insert(
            CONTENT_TYPE, HeaderValue::from_static(self.content_type.as_str())
        );
        if self.status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                WWW_AUTHENTICATE, HeaderValue::from_static("Bearer")
            );
        }
        HttpResponse { response, cause: self.cause }
    }
}


//------------ HttpResponse --------------------------------------------------

#[derive(Debug)]
pub struct HttpResponse {
    response: HyperResponse,

    /// The error that caused a fault response.
    ///
    /// Kept so the error rather than its JSON rendering can be logged.
    cause: Option<Error>,
}

impl HttpResponse {
    pub fn into_hyper(self) -> HyperResponse {
        self.response
    }

    pub fn status(&self) -> StatusCode {
        self.response.status()
    }

    pub fn cause(&self) -> Option<&Error> {
        self.cause.as_ref()
    }

    pub fn body(&self) -> &HyperResponseBody {
        self.response.body()
    }

    pub fn json<O: Serialize>(object: &O) -> Self {
        match serde_json::to_vec(object) {
            Ok(json) => Response {
                status: StatusCode::OK,
                content_type: ContentType::Json,
                body: json.into(),
                cause: None,
            }.finalize(),
            Err(err) => Self::response_from_error(
                Error::internal(format!("cannot encode response: {err}"))
            ),
        }
    }

    /// Returns a fault response for the error.
    pub fn response_from_error(error: Error) -> Self {
        let status = error.status();
        let body = Self::fault_body(&error.to_fault());
        Response {
            status,
            content_type: ContentType::Json,
            body,
            cause: Some(error),
        }.finalize()
    }

    fn fault_body(fault: &Fault) -> Bytes {
        serde_json::to_vec(fault).unwrap_or_default().into()
    }

    /// An empty `200 OK` for operations without a result.
    pub fn ok() -> Self {
        Response::new(StatusCode::OK).finalize()
    }

    pub fn not_found() -> Self {
        Response::new(StatusCode::NOT_FOUND).finalize()
    }

    pub fn method_not_allowed() -> Self {
        Response::new(StatusCode::METHOD_NOT_ALLOWED).finalize()
    }
}


//------------ Tests ---------------------------------------------------------
