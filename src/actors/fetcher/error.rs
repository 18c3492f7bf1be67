use failure::Fail;

/// The outcome of a successful conditional fetch: either a fresh body, or confirmation that the
/// resource hasn't changed since we last saw it. Callers that get `NotModified` must not expect a
/// body anywhere.
#[derive(Debug)]
pub enum Fetched<T> {
    Fresh(T),
    NotModified,
}

impl<T> Fetched<T> {
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Fetched<U> {
        match self {
            Fetched::Fresh(value) => Fetched::Fresh(f(value)),
            Fetched::NotModified => Fetched::NotModified,
        }
    }
}

#[derive(Debug, Fail)]
pub enum FetchError {
    #[fail(display = "Bad status: {}", _0)]
    BadStatus(hyper::StatusCode),

    #[fail(display = "Empty body")]
    EmptyBody,

    #[fail(display = "Media already exists")]
    ExistingMedia,

    #[fail(display = "Hyper error: {}", _0)]
    HyperError(hyper::Error),

    #[fail(display = "Invalid URI: {}", _0)]
    InvalidUri(hyper::http::uri::InvalidUri),

    #[fail(display = "IO error: {}", _0)]
    IoError(std::io::Error),

    #[fail(display = "JSON error: {}", _0)]
    JsonError(serde_json::Error),

    #[fail(display = "Mailbox error: {}", _0)]
    MailboxError(actix::MailboxError),

    #[fail(display = "md5 mismatch: expected {}, computed {}", expected, computed)]
    Md5Mismatch { expected: String, computed: String },

    #[fail(display = "Resource not found: {}", _0)]
    NotFound(String),

    #[fail(display = "Body larger than expected: {} > {}", actual, expected)]
    OversizedBody { actual: u64, expected: u64 },

    #[fail(display = "Request timed out")]
    TimedOut,
}

impl FetchError {
    /// Whether trying again later could plausibly succeed. Verification failures and 404s won't
    /// fix themselves.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::EmptyBody
            | FetchError::ExistingMedia
            | FetchError::InvalidUri(_)
            | FetchError::Md5Mismatch { .. }
            | FetchError::NotFound(_)
            | FetchError::OversizedBody { .. } => false,
            _ => true,
        }
    }
}

macro_rules! impl_enum_from {
    ($variant:ident, $ext_type:ty) => {
        impl From<$ext_type> for FetchError {
            fn from(err: $ext_type) -> Self {
                FetchError::$variant(err)
            }
        }
    };
}

impl_enum_from!(BadStatus, hyper::StatusCode);
impl_enum_from!(HyperError, hyper::Error);
impl_enum_from!(InvalidUri, hyper::http::uri::InvalidUri);
impl_enum_from!(IoError, std::io::Error);
impl_enum_from!(JsonError, serde_json::Error);
impl_enum_from!(MailboxError, actix::MailboxError);
