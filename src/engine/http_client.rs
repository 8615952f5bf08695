use std::time::{Duration, Instant};

use http::{HeaderName, HeaderValue, Method, Request, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use thiserror::Error;

use crate::stats::RequestTimings;

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Response with the body fully read.
#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Bytes,
    pub timings: RequestTimings,
}

#[derive(Clone)]
pub struct HttpClient {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl HttpClient {
    /// Install the process-wide rustls crypto provider. Safe to call repeatedly.
    pub fn install_crypto_provider() {
        let _ = rustls::crypto::ring::default_provider().install_default();
    }

    /// `pool_size`: maximum idle connections kept per host.
    pub fn with_pool_size(pool_size: usize) -> Self {
        Self::install_crypto_provider();
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        let roots = match hyper_rustls::HttpsConnectorBuilder::new().with_native_roots() {
            Ok(builder) => builder,
            Err(e) => {
                tracing::debug!(error = %e, "native root certificates unavailable, using bundled roots");
                hyper_rustls::HttpsConnectorBuilder::new().with_webpki_roots()
            }
        };
        let https = roots
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(pool_size)
            .build(https);

        Self { client }
    }

    /// Send a request and read the whole response body, all within `timeout`.
    // Must be called inside a Tokio runtime
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        headers: &[(String, String)],
        body: Option<&str>,
        timeout: Duration,
    ) -> Result<HttpResponse, RequestError> {
        let uri: Uri = url
            .parse()
            .map_err(|e| RequestError::Invalid(format!("{}: {}", url, e)))?;

        let body_str = body.unwrap_or_default();
        let mut req_size = body_str.len() + method.as_str().len() + 1 + url.len() + 11;
        let mut builder = Request::builder().method(method).uri(uri);
        for (k, v) in headers {
            let name = HeaderName::try_from(k.as_str())
                .map_err(|e| RequestError::Invalid(format!("header {}: {}", k, e)))?;
            let value = HeaderValue::try_from(v.as_str())
                .map_err(|e| RequestError::Invalid(format!("header {}: {}", k, e)))?;
            req_size += k.len() + 2 + v.len() + 2;
            builder = builder.header(name, value);
        }
        req_size += 2;
        let req = builder
            .body(Full::new(Bytes::from(body_str.to_string())))
            .map_err(|e| RequestError::Invalid(e.to_string()))?;

        let request_start = Instant::now();
        let exchange = async {
            let response = self
                .client
                .request(req)
                .await
                .map_err(|e| RequestError::Transport(e.to_string()))?;
            let headers_received = Instant::now();
            let (parts, body_stream) = response.into_parts();
            // The body must be read to completion for the connection to be reused.
            let body = body_stream
                .collect()
                .await
                .map_err(|e| RequestError::Transport(e.to_string()))?
                .to_bytes();
            Ok::<_, RequestError>((parts, body, headers_received))
        };

        let (parts, body, headers_received) = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| RequestError::Timeout(timeout))??;
        let receive_end = Instant::now();

        let mut resp_size = body.len() + 15 + 2;
        for (k, v) in parts.headers.iter() {
            resp_size += k.as_str().len() + 2 + v.len() + 2;
        }

        let timings = RequestTimings {
            waiting: headers_received.duration_since(request_start),
            receiving: receive_end.duration_since(headers_received),
            duration: receive_end.duration_since(request_start),
            request_size: req_size,
            response_size: resp_size,
        };

        Ok(HttpResponse {
            status: parts.status.as_u16(),
            body,
            timings,
        })
    }
}
