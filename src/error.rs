use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    Timeout,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Timeout => "timeout",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    Configuration,
    InvalidRewriteRule,
    InvalidProxy,
    InvalidUri,
    InvalidHeaderName,
    InvalidHeaderValue,
    Serialize,
    Resolution,
    Connection,
    ReadBody,
    ResponseBodyTooLarge,
    DecodeContentEncoding,
    TlsConfig,
    NoResponse,
    Decode,
    HttpStatus,
    Io,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::InvalidRewriteRule => "invalid_rewrite_rule",
            Self::InvalidProxy => "invalid_proxy",
            Self::InvalidUri => "invalid_uri",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::Serialize => "serialize",
            Self::Resolution => "resolution",
            Self::Connection => "connection",
            Self::ReadBody => "read_body",
            Self::ResponseBodyTooLarge => "response_body_too_large",
            Self::DecodeContentEncoding => "decode_content_encoding",
            Self::TlsConfig => "tls_config",
            Self::NoResponse => "no_response",
            Self::Decode => "decode",
            Self::HttpStatus => "http_status",
            Self::Io => "io",
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid configuration: {message}")]
    Configuration { message: String },
    #[error("invalid rewrite rule at row {row}: {message}")]
    InvalidRewriteRule { row: usize, message: String },
    #[error("invalid proxy {proxy}: {message}")]
    InvalidProxy { proxy: String, message: String },
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: http::header::InvalidHeaderName,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    #[error("failed to serialize request {what}: {source}")]
    Serialize {
        what: &'static str,
        #[source]
        source: BoxError,
    },
    #[error("unable to resolve host {host} with nameservers {}", .nameservers.join(", "))]
    Resolution {
        host: String,
        nameservers: Vec<String>,
    },
    #[error("{}", connection_message(.host, .via_proxy, .kind, .detail))]
    Connection {
        host: String,
        via_proxy: bool,
        kind: TransportErrorKind,
        detail: String,
    },
    #[error("failed to read response body from {host}: {source}")]
    ReadBody {
        host: String,
        #[source]
        source: BoxError,
    },
    #[error("response body from {host} exceeds {limit_bytes} bytes")]
    ResponseBodyTooLarge { host: String, limit_bytes: usize },
    #[error("failed to decode response content-encoding {encoding} from {host}: {message}")]
    DecodeContentEncoding {
        encoding: String,
        host: String,
        message: String,
    },
    #[error("invalid tls configuration: {message}")]
    TlsConfig { message: String },
    #[error("{message}")]
    NoResponse {
        message: String,
        #[source]
        source: Option<Box<Error>>,
    },
    #[error("{message}")]
    Decode {
        message: String,
        #[source]
        source: BoxError,
    },
    #[error("http status error {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("io error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

fn connection_message(
    host: &str,
    via_proxy: &bool,
    kind: &TransportErrorKind,
    detail: &str,
) -> String {
    let route = if *via_proxy {
        " (through the configured proxy; check the proxy is reachable)"
    } else {
        ""
    };
    format!("failed to connect to {host}{route} [{kind}]: {detail}")
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Configuration { .. } => ErrorCode::Configuration,
            Self::InvalidRewriteRule { .. } => ErrorCode::InvalidRewriteRule,
            Self::InvalidProxy { .. } => ErrorCode::InvalidProxy,
            Self::InvalidUri { .. } => ErrorCode::InvalidUri,
            Self::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            Self::Serialize { .. } => ErrorCode::Serialize,
            Self::Resolution { .. } => ErrorCode::Resolution,
            Self::Connection { .. } => ErrorCode::Connection,
            Self::ReadBody { .. } => ErrorCode::ReadBody,
            Self::ResponseBodyTooLarge { .. } => ErrorCode::ResponseBodyTooLarge,
            Self::DecodeContentEncoding { .. } => ErrorCode::DecodeContentEncoding,
            Self::TlsConfig { .. } => ErrorCode::TlsConfig,
            Self::NoResponse { .. } => ErrorCode::NoResponse,
            Self::Decode { .. } => ErrorCode::Decode,
            Self::HttpStatus { .. } => ErrorCode::HttpStatus,
            Self::Io { .. } => ErrorCode::Io,
        }
    }

    /// Transport-level failures are the ones a retry may cure.
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::ReadBody { .. })
    }

    pub fn is_configuration(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::Configuration | ErrorCode::InvalidRewriteRule | ErrorCode::InvalidProxy
        )
    }
}
