use core::{
    num::{NonZero, NonZeroU16},
    str::FromStr,
    time::Duration,
};
use std::{
    collections::HashMap,
    fs, io,
    net::Ipv6Addr,
    path::{Path, PathBuf},
};

use bytes::Bytes;
use http::{header, uri::PathAndQuery, HeaderMap, HeaderName, HeaderValue, Method};
use serde::Deserialize;
use serde_yaml::{Mapping, Value};

use crate::cmd::Cmd;

/// Default hostname of the service to warm up.
pub const DEFAULT_HOSTNAME: &str = "localhost";
/// Port assumed when warmup is disabled and no port is given.
pub const DEFAULT_PORT: NonZeroU16 = NonZeroU16::new(80).unwrap();
/// Default number of warmup workers.
pub const DEFAULT_WORKERS: NonZero<usize> = NonZero::<usize>::MIN.saturating_add(1);
/// Default warmup window.
pub const DEFAULT_DURATION: Duration = Duration::from_secs(150);
/// Default timeout of a single warmup request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(4);

/// Configuration errors.
///
/// All of them are fatal and surface from config construction, before any
/// background work is started.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid port ({0:?})")]
    InvalidPort(String),
    #[error("warmup workers cannot be less than 1 (got {0:?})")]
    InvalidWorkerCount(String),
    #[error("invalid duration in seconds ({0:?})")]
    InvalidDuration(String),
    #[error("unsupported or missing HTTP verb for endpoint: {0}")]
    InvalidVerb(String),
    #[error("invalid header {name:?}: {reason}")]
    InvalidHeader { name: String, reason: String },
    #[error("invalid endpoint path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },
    #[error("invalid endpoint body: {0}")]
    InvalidBody(#[from] serde_json::Error),
    #[error("no endpoints configured")]
    NoEndpoints,
    #[error("port is required when warmup is enabled")]
    MissingPort,
    #[error("endpoints file is required when warmup is enabled")]
    MissingEndpoints,
    #[error("failed to read endpoints from '{}': {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("failed to parse endpoints: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Warmup settings.
///
/// Constructed once by the embedding application and handed to the
/// orchestrator by reference. Nothing in this crate mutates it.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether [`crate::trigger`] should do anything at all.
    pub enabled: bool,
    /// Hostname of the service.
    pub hostname: String,
    /// Port the service listens on.
    pub port: NonZeroU16,
    /// Number of concurrent warmup workers.
    pub workers: NonZero<usize>,
    /// Warmup window, measured from orchestration start.
    pub duration: Duration,
    /// How long to wait for the port to open, measured from orchestration
    /// start.
    ///
    /// If none given (the default) the warmup window is used.
    pub port_timeout: Option<Duration>,
    /// Timeout of a single warmup request.
    pub request_timeout: Duration,
    /// Endpoints to call, in round-robin order.
    ///
    /// Never empty when warmup is enabled. A disabled config loaded from the
    /// command line carries none.
    endpoints: Vec<Endpoint>,
}

impl Config {
    /// Constructs a new [`Config`] with default settings.
    pub fn new(port: NonZeroU16, endpoints: Vec<Endpoint>) -> Result<Self, Error> {
        if endpoints.is_empty() {
            return Err(Error::NoEndpoints);
        }

        let m = Self {
            enabled: true,
            hostname: DEFAULT_HOSTNAME.to_string(),
            port,
            workers: DEFAULT_WORKERS,
            duration: DEFAULT_DURATION,
            port_timeout: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            endpoints,
        };

        Ok(m)
    }

    #[inline]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    #[inline]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    #[inline]
    pub fn with_workers(mut self, workers: NonZero<usize>) -> Self {
        self.workers = workers;
        self
    }

    #[inline]
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    #[inline]
    pub fn with_port_timeout(mut self, timeout: Duration) -> Self {
        self.port_timeout = Some(timeout);
        self
    }

    #[inline]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Returns the configured endpoints.
    #[inline]
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Returns the time budget of the port wait phase.
    #[inline]
    pub fn port_timeout(&self) -> Duration {
        self.port_timeout.unwrap_or(self.duration)
    }

    /// Returns the base URL all warmup requests are sent to.
    #[inline]
    pub fn base_url(&self) -> String {
        format!("http://{}", authority(&self.hostname, self.port))
    }
}

/// Formats "host:port", bracketing IPv6 literals.
pub fn authority(hostname: &str, port: NonZeroU16) -> String {
    match hostname.parse::<Ipv6Addr>() {
        Ok(..) => format!("[{hostname}]:{port}"),
        Err(..) => format!("{hostname}:{port}"),
    }
}

impl TryFrom<Cmd> for Config {
    type Error = Error;

    fn try_from(cmd: Cmd) -> Result<Self, Self::Error> {
        let Cmd {
            enabled,
            hostname,
            port,
            endpoints,
            threads,
            time_seconds,
            port_timeout_seconds,
            request_timeout_seconds,
            verbose: _,
        } = cmd;

        let m = Self {
            enabled,
            hostname,
            port: port.unwrap_or(DEFAULT_PORT),
            workers: threads,
            duration: time_seconds,
            port_timeout: port_timeout_seconds,
            request_timeout: request_timeout_seconds,
            endpoints: Vec::new(),
        };

        // Disabled warmup must not fail just because the port or the
        // endpoints file is absent on this host.
        if !m.enabled {
            return Ok(m);
        }

        if port.is_none() {
            return Err(Error::MissingPort);
        }
        let endpoints = load_endpoints(endpoints.ok_or(Error::MissingEndpoints)?)?;
        if endpoints.is_empty() {
            return Err(Error::NoEndpoints);
        }

        Ok(Self { endpoints, ..m })
    }
}

/// A single warmup endpoint.
///
/// The HTTP verb is decided when the endpoint is constructed, so there is no
/// way to end up with a request of an unknown kind later.
#[derive(Debug, Clone, PartialEq)]
pub enum Endpoint {
    Get(Target),
    Post(Target),
    Put(Target),
}

impl Endpoint {
    /// Constructs a GET endpoint for the given path.
    pub fn get(path: &str) -> Result<Self, Error> {
        Ok(Self::Get(Target::new(path)?))
    }

    /// Constructs a POST endpoint for the given path.
    pub fn post(path: &str) -> Result<Self, Error> {
        Ok(Self::Post(Target::new(path)?))
    }

    /// Constructs a PUT endpoint for the given path.
    pub fn put(path: &str) -> Result<Self, Error> {
        Ok(Self::Put(Target::new(path)?))
    }

    /// Adds a header sent with every request to this endpoint.
    ///
    /// Overrides the previously set value of the same header, if any.
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self, Error> {
        let (name, value) = parse_header(name, value)?;
        self.target_mut().headers.insert(name, value);

        Ok(self)
    }

    /// Sets the request body.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.target_mut().body = Some(body.into());
        self
    }

    #[inline]
    pub fn method(&self) -> Method {
        match self {
            Self::Get(..) => Method::GET,
            Self::Post(..) => Method::POST,
            Self::Put(..) => Method::PUT,
        }
    }

    #[inline]
    pub fn target(&self) -> &Target {
        match self {
            Self::Get(t) | Self::Post(t) | Self::Put(t) => t,
        }
    }

    #[inline]
    pub fn path(&self) -> &PathAndQuery {
        &self.target().path
    }

    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.target().headers
    }

    #[inline]
    pub fn body(&self) -> Option<&Bytes> {
        self.target().body.as_ref()
    }

    #[inline]
    fn target_mut(&mut self) -> &mut Target {
        match self {
            Self::Get(t) | Self::Post(t) | Self::Put(t) => t,
        }
    }
}

/// Where and what to send.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    path: PathAndQuery,
    headers: HeaderMap,
    body: Option<Bytes>,
}

impl Target {
    fn new(path: &str) -> Result<Self, Error> {
        let m = Self {
            path: parse_path(path)?,
            headers: HeaderMap::new(),
            body: None,
        };

        Ok(m)
    }
}

/// Endpoint as it appears in the endpoints file.
///
/// ```yaml
/// - get: /apps
///   headers:
///     X-Bar: "456"
/// - post: /foo
///   body: {"hello": "world"}
/// ```
#[derive(Debug, Deserialize)]
struct EndpointRecord {
    get: Option<String>,
    post: Option<String>,
    put: Option<String>,
    #[serde(default)]
    headers: Mapping,
    #[serde(default)]
    body: Option<serde_yaml::Value>,
    #[serde(flatten)]
    other: HashMap<String, Value>,
}

impl TryFrom<EndpointRecord> for Endpoint {
    type Error = Error;

    fn try_from(v: EndpointRecord) -> Result<Self, Self::Error> {
        // Verbs are probed in a fixed priority order.
        let mut endpoint = match (&v.get, &v.post, &v.put) {
            (Some(path), ..) => Self::get(path)?,
            (None, Some(path), _) => Self::post(path)?,
            (None, None, Some(path)) => Self::put(path)?,
            (None, None, None) => {
                let mut keys: Vec<&str> = v.other.keys().map(String::as_str).collect();
                keys.sort_unstable();
                return Err(Error::InvalidVerb(format!("keys {keys:?}")));
            }
        };

        // In file order, so the last of case-variant duplicates wins.
        for (name, value) in &v.headers {
            let invalid = |reason: &str| Error::InvalidHeader {
                name: scalar(name).unwrap_or_else(|| format!("{name:?}")),
                reason: reason.to_string(),
            };
            let name = scalar(name).ok_or_else(|| invalid("name must be a scalar"))?;
            let value = scalar(value).ok_or_else(|| invalid("value must be a scalar"))?;
            endpoint = endpoint.with_header(&name, &value)?;
        }

        match v.body {
            None | Some(Value::Null) => {}
            Some(Value::String(body)) => endpoint = endpoint.with_body(body),
            Some(body) => {
                endpoint = endpoint.with_body(serde_json::to_vec(&body)?);
                let headers = &mut endpoint.target_mut().headers;
                if !headers.contains_key(header::CONTENT_TYPE) {
                    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
                }
            }
        }

        Ok(endpoint)
    }
}

/// Renders a YAML scalar as text.
fn scalar(v: &Value) -> Option<String> {
    match v {
        Value::String(v) => Some(v.clone()),
        Value::Number(v) => Some(v.to_string()),
        Value::Bool(v) => Some(v.to_string()),
        _ => None,
    }
}

/// Parses endpoints in YAML (or JSON) format.
pub fn parse_endpoints(data: &str) -> Result<Vec<Endpoint>, Error> {
    let records: Vec<EndpointRecord> = serde_yaml::from_str(data)?;

    records.into_iter().map(Endpoint::try_from).collect()
}

/// Loads endpoints from the specified path.
pub fn load_endpoints<P>(path: P) -> Result<Vec<Endpoint>, Error>
where
    P: AsRef<Path>,
{
    let path = path.as_ref();
    log::debug!("loading endpoints from '{}' ...", path.display());

    let data = fs::read_to_string(path).map_err(|source| Error::Io { path: path.to_path_buf(), source })?;
    let endpoints = parse_endpoints(&data)?;
    for endpoint in &endpoints {
        log::debug!("loaded endpoint: {} {}", endpoint.method(), endpoint.path());
    }

    Ok(endpoints)
}

/// Parses the enabled flag.
///
/// Only "true" and "1" turn the warmup on, anything else is treated as off.
pub fn parse_enabled(v: &str) -> Result<bool, Error> {
    Ok(matches!(v.trim(), "true" | "1"))
}

/// Parses a TCP port in range 1-65535.
pub fn parse_port(v: &str) -> Result<NonZeroU16, Error> {
    u16::from_str(v.trim())
        .ok()
        .and_then(NonZeroU16::new)
        .ok_or_else(|| Error::InvalidPort(v.to_string()))
}

/// Parses a positive number of workers.
pub fn parse_workers(v: &str) -> Result<NonZero<usize>, Error> {
    usize::from_str(v.trim())
        .ok()
        .and_then(NonZero::new)
        .ok_or_else(|| Error::InvalidWorkerCount(v.to_string()))
}

/// Parses a non-negative, possibly fractional, number of seconds.
pub fn parse_duration(v: &str) -> Result<Duration, Error> {
    f64::from_str(v.trim())
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .ok_or_else(|| Error::InvalidDuration(v.to_string()))
}

fn parse_path(path: &str) -> Result<PathAndQuery, Error> {
    if !path.starts_with('/') {
        return Err(Error::InvalidPath {
            path: path.to_string(),
            reason: "path must be absolute",
        });
    }

    PathAndQuery::from_str(path).map_err(|_| Error::InvalidPath {
        path: path.to_string(),
        reason: "malformed path",
    })
}

fn parse_header(name: &str, value: &str) -> Result<(HeaderName, HeaderValue), Error> {
    let invalid = |reason: String| Error::InvalidHeader { name: name.to_string(), reason };

    let n = HeaderName::from_str(name).map_err(|err| invalid(err.to_string()))?;
    let v = HeaderValue::from_str(value).map_err(|err| invalid(err.to_string()))?;

    Ok((n, v))
}
