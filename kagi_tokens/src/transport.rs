//! The HTTP contract used to reach the identity service
//!
//! The token client never talks to the network directly. Everything goes
//! through an [`HttpTransport`], which makes it possible to supply a
//! different HTTP stack or a scripted transport in tests.

use std::{error, fmt};

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

/// HTTP methods used by the token client
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    /// `GET`
    Get,
    /// `POST`
    Post,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Get => "GET",
            Self::Post => "POST",
        })
    }
}

/// An outgoing request
#[derive(Clone, Debug)]
pub struct HttpRequest {
    /// The request method
    pub method: Method,
    /// The target URL, including any query string
    pub url: Url,
    /// Request headers
    pub headers: Vec<(String, String)>,
    /// A form-encoded body
    pub body: Option<String>,
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

impl HttpRequest {
    /// Constructs a `GET` request
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::Get,
            url,
            headers: vec![("Accept".to_owned(), "application/json".to_owned())],
            body: None,
        }
    }

    /// Constructs a `POST` request with a form-encoded body
    pub fn post_form(url: Url, body: String) -> Self {
        Self {
            method: Method::Post,
            url,
            headers: vec![
                ("Accept".to_owned(), "application/json".to_owned()),
                (
                    "Content-Type".to_owned(),
                    "application/x-www-form-urlencoded".to_owned(),
                ),
            ],
            body: Some(body),
        }
    }

    /// Adds a header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// The first value of a header, compared case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// The decoded pairs of a form-encoded body
    pub fn form_pairs(&self) -> Vec<(String, String)> {
        self.body
            .as_deref()
            .map(|b| {
                url::form_urlencoded::parse(b.as_bytes())
                    .into_owned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The first value of a form-encoded body field
    pub fn form_value(&self, name: &str) -> Option<String> {
        self.form_pairs()
            .into_iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }
}

/// A received response
#[derive(Clone, Debug)]
pub struct HttpResponse {
    /// The HTTP status code
    pub status: u16,
    /// Response headers
    pub headers: Vec<(String, String)>,
    /// The response body
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Constructs a response with a JSON body
    pub fn json(status: u16, body: &serde_json::Value) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".to_owned(), "application/json".to_owned())],
            body: body.to_string().into_bytes(),
        }
    }

    /// The first value of a header, compared case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Whether the status is in the `2xx` range
    #[inline]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// A request could not be completed
#[derive(Debug, Error)]
pub enum TransportError {
    /// The request timed out
    #[error("request timed out")]
    Timeout(#[source] Box<dyn error::Error + Send + Sync + 'static>),
    /// The request could not be sent
    #[error("error sending request")]
    Send(#[source] Box<dyn error::Error + Send + Sync + 'static>),
    /// The response body could not be read
    #[error("error reading response body")]
    Body(#[source] Box<dyn error::Error + Send + Sync + 'static>),
}

impl TransportError {
    /// Whether the error was a timeout
    #[inline]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// An asynchronous HTTP client
#[async_trait]
pub trait HttpTransport: fmt::Debug + Send + Sync {
    /// Sends a request and reads the complete response
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

#[async_trait]
impl<T: HttpTransport + ?Sized> HttpTransport for std::sync::Arc<T> {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        (**self).send(request).await
    }
}

#[cfg(feature = "reqwest")]
#[cfg_attr(docsrs, doc(cfg(feature = "reqwest")))]
mod reqwest_impl {
    use async_trait::async_trait;

    use super::{HttpRequest, HttpResponse, HttpTransport, Method, TransportError};

    fn classify(error: reqwest::Error) -> TransportError {
        if error.is_timeout() {
            TransportError::Timeout(Box::new(error))
        } else {
            TransportError::Send(Box::new(error))
        }
    }

    #[async_trait]
    impl HttpTransport for reqwest::Client {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
            let method = match request.method {
                Method::Get => reqwest::Method::GET,
                Method::Post => reqwest::Method::POST,
            };

            let mut builder = self.request(method, request.url);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(body) = request.body {
                builder = builder.body(body);
            }

            let resp = builder.send().await.map_err(classify)?;

            let status = resp.status().as_u16();
            let headers = resp
                .headers()
                .iter()
                .filter_map(|(k, v)| Some((k.as_str().to_owned(), v.to_str().ok()?.to_owned())))
                .collect();
            let body = resp
                .bytes()
                .await
                .map_err(|e| TransportError::Body(Box::new(e)))?
                .to_vec();

            tracing::trace!(http.status_code = status, "received response");

            Ok(HttpResponse {
                status,
                headers,
                body,
            })
        }
    }
}
