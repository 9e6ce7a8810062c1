use thiserror::Error;

/// Failure to obtain PAC script text from its source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to read PAC file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to fetch PAC script: {0}")]
    Http(#[from] reqwest::Error),

    #[error("PAC server returned status {0}")]
    HttpStatus(u16),
}

/// The PAC script could not be evaluated: it failed to parse, threw at
/// runtime, exhausted its execution budget, or returned a non-string.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("script syntax error at line {line}: {message}")]
    Syntax { line: u32, message: String },

    #[error("script error: {0}")]
    Runtime(String),

    #[error("script exceeded its execution budget")]
    BudgetExceeded,

    #[error("FindProxyForURL is not defined")]
    MissingEntryPoint,

    #[error("FindProxyForURL returned a non-string value: {0}")]
    NonStringResult(&'static str),
}

/// A malformed proxy-spec string returned by a PAC script.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("proxy segment {0:?} has an empty host")]
    EmptyHost(String),

    #[error("proxy segment {0:?} has an invalid port")]
    InvalidPort(String),

    #[error("proxy segment {0:?} has an invalid host: {1}")]
    InvalidHost(String, std::io::Error),
}

/// A single resolution attempt failed end to end. Callers treat this as
/// "no usable proxy" and apply their own fallback.
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("PAC source error: {0}")]
    Source(#[from] SourceError),

    #[error("PAC evaluation error: {0}")]
    Eval(#[from] EvalError),

    #[error("PAC result parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("refusing to resolve {0}: the PAC source references it")]
    LoopDetected(String),
}

/// The upstream proxy rejected the tunnel or the handshake failed.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("i/o error during upstream handshake: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out connecting to upstream proxy")]
    Timeout,

    #[error("could not resolve upstream proxy address {0}")]
    Unresolvable(String),

    #[error("upstream proxy refused CONNECT: {0}")]
    HttpRejected(String),

    #[error("unexpected version byte {0:#04x} from upstream proxy")]
    BadVersion(u8),

    #[error("upstream proxy rejected the selected auth method")]
    AuthMethodRejected,

    #[error("upstream proxy rejected credentials (status {0})")]
    AuthFailed(u8),

    #[error("upstream SOCKS proxy replied with error code {0}")]
    SocksRejected(u8),

    #[error("destination host too long for a SOCKS domain address: {0}")]
    HostTooLong(String),
}

/// The front-end client violated the SOCKS5 protocol subset we accept.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("i/o error during client handshake: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported SOCKS version {0:#04x}")]
    BadVersion(u8),

    #[error("unsupported SOCKS command {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("unsupported address type {0:#04x}")]
    UnsupportedAddressType(u8),

    #[error("malformed address in request: {0}")]
    BadAddress(String),
}
