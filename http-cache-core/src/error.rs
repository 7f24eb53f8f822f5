use miette::Diagnostic;
use thiserror::Error;

/// A `Result` typedef to use with the [`CacheError`] type.
pub type Result<T> = std::result::Result<T, CacheError>;

/// The error kinds the caching core can surface.
///
/// Header parsing never produces one of these: an unparsable directive is
/// simply treated as absent (see [`crate::directives`]). Everything here is
/// either a storage I/O problem, a corrupt persisted record, or a misuse of
/// the state machine by a caller.
#[derive(Error, Diagnostic, Debug)]
pub enum CacheError {
    /// The response body stream offered to the proxy has already been
    /// consumed and cannot be replayed or teed into storage.
    #[error("response stream already consumed")]
    #[diagnostic(code(http_cache_core::stream_already_consumed))]
    StreamAlreadyConsumed,

    /// The storage backend could not be reached. Callers should degrade to
    /// pass-through rather than propagate this to the application.
    #[error("cache storage unavailable: {0}")]
    #[diagnostic(code(http_cache_core::storage_unavailable))]
    StorageUnavailable(String),

    /// A stored entry's `data` column failed to deserialize. The entry is
    /// soft-deleted and skipped by the caller.
    #[error("stored entry is corrupt: {0}")]
    #[diagnostic(code(http_cache_core::serialization))]
    SerializationError(String),

    /// A transition method was called on a state that doesn't support it, or
    /// with inputs that don't satisfy the state's contract (e.g. resolving a
    /// [`crate::state_machine::NeedRevalidation`] whose candidate set is
    /// empty). This is a programmer error.
    #[error("state machine misuse: {0}")]
    #[diagnostic(code(http_cache_core::state_machine_misuse))]
    StateMachineMisuse(String),

    /// An error returned verbatim from the `request_sender` collaborator.
    #[error(transparent)]
    #[diagnostic(code(http_cache_core::origin))]
    OriginError(#[from] Box<dyn std::error::Error + Send + Sync>),

    /// A malformed header value prevented request/response construction.
    #[error(transparent)]
    #[diagnostic(code(http_cache_core::http))]
    Http(#[from] http::Error),

    /// There was an error parsing a URL.
    #[error(transparent)]
    #[diagnostic(code(http_cache_core::invalid_url))]
    InvalidUrl(#[from] url::ParseError),

    /// There was an error constructing or reading a header value.
    #[error(transparent)]
    #[diagnostic(code(http_cache_core::invalid_header_value))]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),
}
