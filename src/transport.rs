use crate::error::{ErrorKind, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1::{self, SendRequest};
use hyper::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST, UPGRADE};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tracing::debug;

pub use hyper::Method;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10_000);
pub const DEFAULT_TCP_PORT: u16 = 2375;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp { host: String, port: u16 },
}

impl Endpoint {
    fn authority(&self) -> String {
        match self {
            Self::Unix(_) => "localhost".to_string(),
            Self::Tcp { host, port } => format!("{host}:{port}"),
        }
    }
}

impl FromStr for Endpoint {
    type Err = ErrorKind;

    fn from_str(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if let Some(path) = raw.strip_prefix("unix://") {
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        if raw.starts_with('/') {
            return Ok(Self::Unix(PathBuf::from(raw)));
        }

        let rest = ["http://", "tcp://"]
            .iter()
            .find_map(|scheme| raw.strip_prefix(scheme))
            .ok_or_else(|| ErrorKind::Unsupported(format!("endpoint `{raw}`")))?;
        let authority = rest.split('/').next().unwrap_or_default();
        if authority.is_empty() {
            return Err(ErrorKind::Unsupported(format!("endpoint `{raw}` has no host")));
        }

        match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| ErrorKind::Unsupported(format!("endpoint port `{port}`")))?;
                Ok(Self::Tcp {
                    host: host.to_string(),
                    port,
                })
            }
            None => Ok(Self::Tcp {
                host: authority.to_string(),
                port: DEFAULT_TCP_PORT,
            }),
        }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
            Self::Tcp { host, port } => write!(f, "http://{host}:{port}"),
        }
    }
}

/// Declared shape of a response body. Drives how an empty 2xx body is
/// normalized and whether a body without a JSON content type is parsed.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Expect {
    List,
    Object,
    Text,
    Raw,
    Nothing,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
    pub expect: Expect,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path, Expect::Object)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path, Expect::Nothing)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path, Expect::Nothing)
    }

    fn new(method: Method, path: impl Into<String>, expect: Expect) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            expect,
        }
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn expect(mut self, expect: Expect) -> Self {
        self.expect = expect;
        self
    }

    /// Path without its query string.
    pub fn route(&self) -> &str {
        self.path.split('?').next().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Text(String),
    Bytes(Bytes),
    Empty,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub payload: Payload,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(self) -> Result<T> {
        let decoded = match self.payload {
            Payload::Json(value) => serde_json::from_value(value),
            Payload::Text(text) => serde_json::from_str(&text),
            Payload::Bytes(bytes) => serde_json::from_slice(&bytes),
            Payload::Empty => serde_json::from_value(Value::Null),
        };
        decoded.map_err(|error| ErrorKind::InvalidResponse(error.to_string()))
    }

    pub fn text(self) -> String {
        match self.payload {
            Payload::Json(value) => value.to_string(),
            Payload::Text(text) => text,
            Payload::Bytes(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Payload::Empty => String::new(),
        }
    }

    pub fn bytes(self) -> Bytes {
        match self.payload {
            Payload::Json(value) => Bytes::from(value.to_string()),
            Payload::Text(text) => Bytes::from(text),
            Payload::Bytes(bytes) => bytes,
            Payload::Empty => Bytes::new(),
        }
    }
}

pub fn normalize_body(
    status: u16,
    content_type: Option<&str>,
    bytes: &[u8],
    expect: Expect,
) -> Result<ApiResponse> {
    if !(200..300).contains(&status) {
        return Err(ErrorKind::http(status, bytes));
    }

    let payload = if expect == Expect::Raw {
        Payload::Bytes(Bytes::copy_from_slice(bytes))
    } else {
        decode_payload(content_type, bytes, expect)?
    };
    Ok(ApiResponse { status, payload })
}

fn decode_payload(content_type: Option<&str>, bytes: &[u8], expect: Expect) -> Result<Payload> {
    let text = String::from_utf8_lossy(bytes);
    if text.trim().is_empty() {
        return Ok(match expect {
            Expect::List => Payload::Json(Value::Array(Vec::new())),
            Expect::Object => Payload::Json(Value::Object(Map::new())),
            Expect::Text => Payload::Text(String::new()),
            Expect::Raw | Expect::Nothing => Payload::Empty,
        });
    }

    let declared_json = content_type
        .map(|content_type| content_type.to_ascii_lowercase().contains("json"))
        .unwrap_or(false);
    let wants_json = matches!(expect, Expect::List | Expect::Object);

    if declared_json || wants_json {
        return serde_json::from_str(&text)
            .map(Payload::Json)
            .map_err(|error| ErrorKind::InvalidResponse(format!("malformed JSON body: {error}")));
    }

    Ok(Payload::Text(text.into_owned()))
}

pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Both directions of an upgraded connection.
pub struct Duplex {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl Duplex {
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn endpoint(&self) -> String;

    async fn request(&self, request: ApiRequest) -> Result<ApiResponse>;

    /// Opens a long-lived response body. The returned stream yields chunks in
    /// arrival order and ends when the engine closes the body.
    async fn open_stream(&self, path: &str) -> Result<ByteStream>;

    async fn upgrade(&self, path: &str, _body: Value) -> Result<Duplex> {
        Err(ErrorKind::Unsupported(format!(
            "connection upgrade for {path}"
        )))
    }
}

type RequestSender = SendRequest<Full<Bytes>>;

pub struct HttpTransport {
    endpoint: Endpoint,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(endpoint: Endpoint, timeout: Duration) -> Self {
        Self { endpoint, timeout }
    }

    fn timeout_ms(&self) -> u64 {
        u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX)
    }

    fn unavailable(&self, reason: impl Display) -> ErrorKind {
        ErrorKind::ConnectionUnavailable {
            endpoint: self.endpoint.to_string(),
            reason: reason.to_string(),
        }
    }

    async fn bounded<T>(&self, future: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.timeout, future).await {
            Ok(result) => result,
            Err(_) => Err(ErrorKind::Timeout(self.timeout_ms())),
        }
    }

    async fn connect(&self) -> Result<RequestSender> {
        match &self.endpoint {
            Endpoint::Unix(path) => {
                let stream = UnixStream::connect(path)
                    .await
                    .map_err(|error| self.unavailable(error))?;
                self.handshake(stream).await
            }
            Endpoint::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port))
                    .await
                    .map_err(|error| self.unavailable(error))?;
                self.handshake(stream).await
            }
        }
    }

    async fn handshake<S>(&self, stream: S) -> Result<RequestSender>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (sender, connection) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|error| self.unavailable(format!("HTTP handshake failed: {error}")))?;

        tokio::spawn(async move {
            if let Err(error) = connection.with_upgrades().await {
                debug!("engine connection closed: {error}");
            }
        });

        Ok(sender)
    }

    fn build(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        upgrade: bool,
    ) -> Result<Request<Full<Bytes>>> {
        let mut builder = Request::builder()
            .method(method)
            .uri(format!("http://{}{path}", self.endpoint.authority()))
            .header(HOST, self.endpoint.authority());
        if upgrade {
            builder = builder.header(CONNECTION, "Upgrade").header(UPGRADE, "tcp");
        }

        let body = match body {
            Some(body) => {
                let encoded = serde_json::to_vec(body)
                    .map_err(|error| ErrorKind::InvalidResponse(error.to_string()))?;
                builder = builder
                    .header(CONTENT_TYPE, "application/json")
                    .header(CONTENT_LENGTH, encoded.len());
                Full::new(Bytes::from(encoded))
            }
            None => Full::new(Bytes::new()),
        };

        builder
            .body(body)
            .map_err(|error| ErrorKind::InvalidResponse(format!("cannot build request for {path}: {error}")))
    }

    async fn send(&self, request: Request<Full<Bytes>>) -> Result<Response<Incoming>> {
        let mut sender = self.connect().await?;
        sender
            .send_request(request)
            .await
            .map_err(|error| self.unavailable(error))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn endpoint(&self) -> String {
        self.endpoint.to_string()
    }

    async fn request(&self, request: ApiRequest) -> Result<ApiResponse> {
        let expect = request.expect;
        let http_request = self.build(
            request.method.clone(),
            &request.path,
            request.body.as_ref(),
            false,
        )?;
        debug!("{} {}", request.method, request.path);

        self.bounded(async {
            let response = self.send(http_request).await?;
            let status = response.status().as_u16();
            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            let bytes = response
                .into_body()
                .collect()
                .await
                .map_err(|error| self.unavailable(format!("failed to read body: {error}")))?
                .to_bytes();
            normalize_body(status, content_type.as_deref(), &bytes, expect)
        })
        .await
    }

    async fn open_stream(&self, path: &str) -> Result<ByteStream> {
        let http_request = self.build(Method::GET, path, None, false)?;
        let response = self.bounded(self.send(http_request)).await?;

        let status = response.status();
        if !status.is_success() {
            let bytes = self
                .bounded(async {
                    response
                        .into_body()
                        .collect()
                        .await
                        .map_err(|error| self.unavailable(error))
                })
                .await?
                .to_bytes();
            return Err(ErrorKind::http(status.as_u16(), &bytes));
        }

        debug!("opened stream {path}");
        let endpoint = self.endpoint.to_string();
        let stream = response.into_body().into_data_stream().map(move |chunk| {
            chunk.map_err(|error| ErrorKind::ConnectionUnavailable {
                endpoint: endpoint.clone(),
                reason: error.to_string(),
            })
        });
        Ok(stream.boxed())
    }

    async fn upgrade(&self, path: &str, body: Value) -> Result<Duplex> {
        let http_request = self.build(Method::POST, path, Some(&body), true)?;
        let response = self.bounded(self.send(http_request)).await?;

        let status = response.status();
        if status == StatusCode::SWITCHING_PROTOCOLS {
            let upgraded = self
                .bounded(async {
                    hyper::upgrade::on(response)
                        .await
                        .map_err(|error| self.unavailable(format!("upgrade failed: {error}")))
                })
                .await?;
            debug!("upgraded connection for {path}");
            return Ok(Duplex::new(TokioIo::new(upgraded)));
        }

        if status.is_success() {
            return Err(ErrorKind::Unsupported(format!(
                "engine answered {status} to an upgrade request for {path}"
            )));
        }

        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|error| self.unavailable(error))?
            .to_bytes();
        Err(ErrorKind::http(status.as_u16(), &bytes))
    }
}
