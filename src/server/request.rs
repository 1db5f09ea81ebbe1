//! HTTP requests.

use std::str::FromStr;
use bytes::Bytes;
use http_body_util::{BodyExt, Limited};
use hyper::Method;
use hyper::body::Body;
use hyper::header::{AUTHORIZATION, USER_AGENT};
use openssl::memcmp;
use serde::de::DeserializeOwned;
use crate::commons::error::Error;
use crate::config::Config;
use super::HttpServer;
use super::response::HttpResponse;


//------------ HyperRequest --------------------------------------------------

/// A type alias for the request we receive from Hyper.
pub type HyperRequest = hyper::Request<hyper::body::Incoming>;


//------------ Request -------------------------------------------------------

/// An enriched request.
pub struct Request<'a> {
    /// The underlying raw request.
    request: HyperRequest,

    /// The server the request is for.
    server: &'a HttpServer,
}

impl<'a> Request<'a> {
    pub fn new(request: HyperRequest, server: &'a HttpServer) -> Self {
        Request { request, server }
    }

    /// Checks whether the request is a POST or returns an error response.
    pub fn check_post(&self) -> Result<(), HttpResponse> {
        match *self.request.method() {
            Method::POST => Ok(()),
            _ => Err(HttpResponse::method_not_allowed()),
        }
    }

    /// Returns the current request path.
    pub fn path(&self) -> RequestPath {
        RequestPath { path: self.request.uri().path().to_string() }
    }

    /// Returns the user agent header if present and printable.
    pub fn user_agent(&self) -> Option<&str> {
        self.request.headers().get(USER_AGENT).and_then(|value| {
            value.to_str().ok()
        })
    }

    /// Checks the bearer token if the server requires one.
    pub fn check_auth(&self) -> Result<(), Error> {
        let Some(expected) = self.server.auth_token() else {
            return Ok(())
        };
        let presented = self.request.headers().get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .ok_or(Error::Unauthorized)?;
        if presented.len() == expected.len()
            && memcmp::eq(presented.as_bytes(), expected.as_bytes())
        {
            Ok(())
        }
        else {
            Err(Error::Unauthorized)
        }
    }

    /// Reads a JSON object from the body.
    ///
    /// An empty body is read as the empty object, so operations without
    /// parameters can be called without one.
    pub async fn read_json<T: DeserializeOwned>(
        self
    ) -> Result<(&'a HttpServer, T), Error> {
        let (server, bytes) = self.read_body().await?;
        let bytes = if bytes.is_empty() {
            Bytes::from_static(b"{}")
        }
        else {
            bytes
        };
        let json = serde_json::from_slice(&bytes).map_err(|err| {
            Error::invalid_request(format!("invalid request body: {err}"))
        })?;
        Ok((server, json))
    }

    async fn read_body(self) -> Result<(&'a HttpServer, Bytes), Error> {
        // If the Content-Length already tells us the body is too big, we
        // don't even start reading. Otherwise, Limited stops us once we
        // are past the limit.
        let limit = self.server.limits().post_limit;
        if self.request.body().size_hint().lower() > limit {
            return Err(Error::invalid_request(format!(
                "request body exceeds {limit} bytes"
            )))
        }

        Ok((
            self.server,
            Limited::new(
                self.request.into_body(),
                limit.try_into().unwrap_or(usize::MAX),
            ).collect().await.map_err(|err| {
                Error::invalid_request(format!(
                    "cannot read request body: {err}"
                ))
            })?.to_bytes()
        ))
    }
}


//------------ RequestPath ---------------------------------------------------

/// The path of a request's URI.
///
/// It primarily allows iterating over the path segments.
#[derive(Clone, Debug)]
pub struct RequestPath {
    path: String,
}

impl RequestPath {
    pub fn as_str(&self) -> &str {
        &self.path
    }

    pub fn iter(&self) -> PathIter<'_> {
        PathIter::new(&self.path)
    }
}

impl AsRef<str> for RequestPath {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}


//------------ PathIter ------------------------------------------------------

#[derive(Debug)]
pub struct PathIter<'a> {
    remaining: Option<&'a str>,
}

impl<'a> PathIter<'a> {
    fn new(path: &'a str) -> Self {
        PathIter {
            remaining: Some(path.strip_prefix('/').unwrap_or(path))
        }
    }

    pub fn remaining(&self) -> Option<&str> {
        self.remaining
    }

    /// Checks that the path has been exhausted.
    ///
    /// A single trailing slash is accepted. Returns a 404 error response
    /// otherwise.
    pub fn check_exhausted(&self) -> Result<(), HttpResponse> {
        match self.remaining {
            None | Some("") => Ok(()),
            Some(_) => Err(HttpResponse::not_found()),
        }
    }

    /// Parses the next segment as the given type or returns a Not Found.
    pub fn parse_next<T: FromStr>(&mut self) -> Result<T, HttpResponse> {
        T::from_str(
            self.next().ok_or_else(HttpResponse::not_found)?
        ).map_err(|_| {
            HttpResponse::not_found()
        })
    }
}

impl<'a> Iterator for PathIter<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<Self::Item> {
        let remaining = self.remaining?;
        match remaining.find('/') {
            Some(slash) => {
                self.remaining = Some(&remaining[slash + 1..]);
                Some(&remaining[..slash])
            }
            None => {
                self.remaining = None;
                Some(remaining)
            }
        }
    }
}


//------------ BodyLimits ----------------------------------------------------

/// The size limits of a request body.
#[derive(Clone, Copy, Debug)]
pub struct BodyLimits {
    pub post_limit: u64,
}

impl BodyLimits {
    pub fn from_config(config: &Config) -> Self {
        BodyLimits { post_limit: config.post_limit }
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::rpc::RpcOperation;

    fn path(s: &str) -> RequestPath {
        RequestPath { path: s.to_string() }
    }

    #[test]
    fn request_path_next() {
        let path = path("/rpc/v1/sign/");
        let mut iter = path.iter();
        assert_eq!(iter.next(), Some("rpc"));
        assert_eq!(iter.next(), Some("v1"));
        assert_eq!(iter.next(), Some("sign"));
        assert!(iter.check_exhausted().is_ok());
        assert_eq!(iter.next(), Some(""));
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn parse_operation_segment() {
        let path = path("/rpc/v1/list-tokens/extra");
        let mut iter = path.iter();
        iter.next();
        iter.next();
        let op: RpcOperation = iter.parse_next().unwrap();
        assert_eq!(op, RpcOperation::ListTokens);
        assert_eq!(iter.remaining(), Some("extra"));
        assert!(iter.check_exhausted().is_err());

        let path = self::path("/rpc/v1/format-disk");
        let mut iter = path.iter();
        iter.next();
        iter.next();
        assert!(iter.parse_next::<RpcOperation>().is_err());
    }
}
