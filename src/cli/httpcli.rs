//! Helper functions for the RPC calls of the client.

use std::{env, fmt};
use reqwest::{Response, StatusCode};
use reqwest::header::{
    AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT
};
use serde::de::DeserializeOwned;
use serde::ser::Serialize;
use crate::api::fault::Fault;
use crate::constants::{SIGNER_CLI_API_ENV, SIGNER_USER_AGENT};

const JSON_CONTENT: &str = "application/json";


/// Prints the call instead of performing it.
fn report_post_and_exit(uri: &str, body: &str) {
    println!("POST:\n  {uri}");
    println!("Body:\n{body}");
    std::process::exit(0);
}

/// Returns whether the environment asks to only print calls.
pub fn api_only_from_env() -> bool {
    env::var(SIGNER_CLI_API_ENV).is_ok()
}


//------------ Target --------------------------------------------------------

/// Where and how to send a call.
#[derive(Clone, Copy, Debug)]
pub struct Target<'a> {
    pub uri: &'a str,
    pub token: Option<&'a str>,

    /// Only print the call and exit.
    pub api_only: bool,
}

/// Performs a POST of data that can be serialized into JSON and expects
/// a JSON response that can be deserialized into the expected type.
pub async fn post_json_with_response<T: DeserializeOwned>(
    client: &reqwest::Client,
    target: Target<'_>,
    data: impl Serialize,
) -> Result<T, Error> {
    match post_json_with_opt_response(client, target, data).await? {
        None => Err(Error::response(target.uri, "expected JSON response")),
        Some(res) => Ok(res),
    }
}

/// Performs a POST of data that can be serialized into JSON and expects
/// an empty 200 OK response.
pub async fn post_json(
    client: &reqwest::Client,
    target: Target<'_>,
    data: impl Serialize,
) -> Result<(), Error> {
    let uri = target.uri;
    let res = do_post(client, target, data).await?;
    match opt_text_response(uri, res).await? {
        None => Ok(()),
        Some(_) => Err(Error::response(uri, "expected empty response")),
    }
}

/// Performs a POST of data that can be serialized into JSON and expects
/// an optional JSON response.
pub async fn post_json_with_opt_response<T: DeserializeOwned>(
    client: &reqwest::Client,
    target: Target<'_>,
    data: impl Serialize,
) -> Result<Option<T>, Error> {
    let uri = target.uri;
    let res = do_post(client, target, data).await?;
    match opt_text_response(uri, res).await? {
        None => Ok(None),
        Some(s) => {
            let res: T = serde_json::from_str(&s).map_err(|e| {
                Error::response(
                    uri,
                    format!("could not parse JSON response: {e}"),
                )
            })?;
            Ok(Some(res))
        }
    }
}

async fn do_post(
    client: &reqwest::Client,
    target: Target<'_>,
    data: impl Serialize,
) -> Result<Response, Error> {
    let uri = target.uri;
    let body = serde_json::to_string_pretty(&data)
        .map_err(|e| Error::request_build(uri, e))?;

    if target.api_only {
        report_post_and_exit(uri, &body);
    }

    client
        .post(uri)
        .headers(headers(uri, target.token)?)
        .body(body)
        .send()
        .await
        .map_err(|e| Error::execute(uri, e))
}

fn headers(uri: &str, token: Option<&str>) -> Result<HeaderMap, Error> {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static(SIGNER_USER_AGENT));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT));
    if let Some(token) = token {
        let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| Error::request_build(uri, e))?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }
    Ok(headers)
}

async fn opt_text_response(
    uri: &str,
    res: Response,
) -> Result<Option<String>, Error> {
    match res.status() {
        StatusCode::OK => match res.text().await.ok() {
            None => Ok(None),
            Some(s) => {
                if s.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(s))
                }
            }
        },
        _ => Err(Error::from_res(uri, res).await),
    }
}


//------------ Error ---------------------------------------------------------

#[derive(Debug)]
pub enum Error {
    RequestBuild(String, String),
    Execute(String, String),
    Response(String, String),

    /// The server rejected the call with a fault.
    Fault(String, StatusCode, Fault),

    /// The server answered with an error that isn't a fault.
    Status(String, StatusCode, String),
}

impl Error {
    pub fn request_build(uri: &str, msg: impl fmt::Display) -> Self {
        Error::RequestBuild(uri.to_string(), msg.to_string())
    }

    pub fn execute(uri: &str, msg: impl fmt::Display) -> Self {
        Error::Execute(uri.to_string(), msg.to_string())
    }

    pub fn response(uri: &str, msg: impl fmt::Display) -> Self {
        Error::Response(uri.to_string(), msg.to_string())
    }

    async fn from_res(uri: &str, res: Response) -> Self {
        let status = res.status();
        let text = res.text().await.unwrap_or_default();
        match serde_json::from_str::<Fault>(&text) {
            Ok(fault) => Error::Fault(uri.to_string(), status, fault),
            Err(_) => Error::Status(uri.to_string(), status, text),
        }
    }

    /// Returns the fault sent by the server, if any.
    pub fn fault(&self) -> Option<&Fault> {
        match self {
            Error::Fault(_, _, fault) => Some(fault),
            _ => None,
        }
    }

    /// Returns the HTTP status of a rejected call.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Fault(_, status, _) | Error::Status(_, status, _) => {
                Some(*status)
            }
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::RequestBuild(uri, msg) => {
                write!(f, "Issue creating request for URI: {uri}, error: {msg}")
            }
            Error::Execute(uri, msg) => {
                write!(f, "Issue accessing URI: {uri}, error: {msg}")
            }
            Error::Response(uri, msg) => {
                write!(f, "Issue processing response from URI: {uri}, error: {msg}")
            }
            Error::Fault(_, _, fault) => write!(f, "{fault}"),
            Error::Status(uri, status, text) => {
                if text.is_empty() {
                    write!(f, "Error response from URI: {uri}, status: {status}")
                }
                else {
                    write!(
                        f, "Error response from URI: {uri}, status: {status}, \
                            body: {text}"
                    )
                }
            }
        }
    }
}

impl std::error::Error for Error { }
