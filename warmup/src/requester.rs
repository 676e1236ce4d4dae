use core::num::NonZeroU16;

use anyhow::Error;
use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use http_body_util::Full;

use crate::{
    cfg::{self, Endpoint},
    transport::Transport,
    Produce, VecProduce,
};

/// Headers sent with every warmup request, unless overridden per endpoint.
pub const DEFAULT_HEADERS: [(&str, &str); 3] = [
    ("x-forwarded-proto", "https"),
    ("x-request-id", "warmup"),
    ("x-client-id", "warmup"),
];

/// Returns [`DEFAULT_HEADERS`] as a header map.
pub fn default_headers() -> HeaderMap {
    DEFAULT_HEADERS
        .into_iter()
        .map(|(name, value)| (HeaderName::from_static(name), HeaderValue::from_static(value)))
        .collect()
}

/// Issues one request per call, cycling through the configured endpoints.
///
/// A single requester is meant to be shared by all workers of a warmup run,
/// keeping the round-robin order global.
#[derive(Debug)]
pub struct Requester<T> {
    /// Headers every request starts with. Includes "Host".
    headers: HeaderMap,
    /// Endpoints to call.
    endpoints: VecProduce<Endpoint>,
    transport: T,
}

impl<T> Requester<T> {
    pub fn new(
        hostname: &str,
        port: NonZeroU16,
        default_headers: HeaderMap,
        endpoints: Vec<Endpoint>,
        transport: T,
    ) -> Result<Self, cfg::Error> {
        if endpoints.is_empty() {
            return Err(cfg::Error::NoEndpoints);
        }

        let host = cfg::authority(hostname, port);
        let host = HeaderValue::from_str(&host).map_err(|err| cfg::Error::InvalidHeader {
            name: header::HOST.to_string(),
            reason: err.to_string(),
        })?;

        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, host);
        for (name, value) in &default_headers {
            headers.insert(name.clone(), value.clone());
        }

        let m = Self {
            headers,
            endpoints: VecProduce::new(endpoints),
            transport,
        };

        Ok(m)
    }

    #[inline]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Builds the request for the given endpoint.
    ///
    /// Endpoint headers override default ones.
    fn request(&self, endpoint: &Endpoint) -> Result<Request<Full<Bytes>>, Error> {
        let mut headers = self.headers.clone();
        for (name, value) in endpoint.headers() {
            headers.insert(name.clone(), value.clone());
        }

        let body = endpoint.body().cloned().unwrap_or_default();
        let mut request = Request::builder()
            .method(endpoint.method())
            .uri(endpoint.path().as_str())
            .body(Full::new(body))?;
        *request.headers_mut() = headers;

        Ok(request)
    }
}

impl<T> Requester<T>
where
    T: Transport,
{
    /// Performs a request to the next endpoint.
    ///
    /// Network failures and non-200 responses are only logged. The cursor
    /// advances regardless of the outcome.
    pub async fn call(&self) -> Result<(), Error> {
        let endpoint = self.endpoints.next();
        let path = endpoint.path();

        log::debug!("requesting {} {path}", endpoint.method());
        let request = self.request(endpoint)?;

        match self.transport.send(request).await {
            Ok(StatusCode::OK) => log::debug!("request to {path} successful"),
            Ok(code) => log::warn!("request to {path} failed with code {}", code.as_u16()),
            Err(err) => log::warn!("request to {path} failed: {err:#}"),
        }

        Ok(())
    }
}
