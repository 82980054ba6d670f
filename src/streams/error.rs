use std::{error::Error, fmt, sync::Arc};

pub type StreamResult<T> = Result<T, StreamError>;

/// Errors surfaced by streams, readers, writers and controllers.
///
/// Usage errors (locking, writing after close, detached buffers) are returned
/// directly at the call site. Stream errors are stored on the stream once it
/// errors and handed to every pending and future request.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StreamError {
    #[error("Stream operation was canceled")]
    Canceled,
    #[error("Stream was aborted{}", .0.as_ref().map(|r| format!(": {r}")).unwrap_or_default())]
    Aborted(Option<String>),
    #[error("Stream is closing")]
    Closing,
    #[error("Stream is closed")]
    Closed,
    #[error("Stream is errored")]
    Errored,
    #[error("Stream is locked to a reader or writer")]
    Locked,
    #[error("Reader or writer lock was released")]
    Released,
    #[error("Transform stream was terminated")]
    Terminated,
    #[error("Destination stream is closed")]
    DestinationClosed,
    #[error("Buffer is detached")]
    Detached,
    #[error("Insufficient bytes to fill elements in the given buffer")]
    InsufficientBytes,
    #[error("Invalid state: {0}")]
    InvalidState(&'static str),
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("Out of range: {0}")]
    OutOfRange(&'static str),
    #[error("Stream task was dropped")]
    TaskDropped,
    /// Composite reason used when both branches of a tee are canceled.
    #[error("Both tee branches were canceled")]
    TeeCanceled {
        branch1: Option<Box<StreamError>>,
        branch2: Option<Box<StreamError>>,
    },
    #[error("{0}")]
    Other(#[source] Arc<dyn Error + Send + Sync>),
}

impl StreamError {
    /// Wrap any error type into `StreamError`
    pub fn other<E>(e: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        StreamError::Other(Arc::new(e))
    }

    /// Wrap a boxed error
    pub fn other_boxed(e: Box<dyn Error + Send + Sync>) -> Self {
        StreamError::Other(e.into())
    }

    pub(crate) fn tee_canceled(branch1: Option<StreamError>, branch2: Option<StreamError>) -> Self {
        StreamError::TeeCanceled {
            branch1: branch1.map(Box::new),
            branch2: branch2.map(Box::new),
        }
    }
}

#[derive(Debug)]
struct Message(String);

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Error for Message {}

impl From<&str> for StreamError {
    fn from(s: &str) -> Self {
        StreamError::Other(Arc::new(Message(s.to_string())))
    }
}

impl From<String> for StreamError {
    fn from(s: String) -> Self {
        StreamError::Other(Arc::new(Message(s)))
    }
}

impl From<std::io::Error> for StreamError {
    fn from(e: std::io::Error) -> Self {
        StreamError::Other(Arc::new(e))
    }
}

impl From<Box<dyn Error + Send + Sync>> for StreamError {
    fn from(e: Box<dyn Error + Send + Sync>) -> Self {
        StreamError::Other(e.into())
    }
}

/// Adds direct `From` implementations for user error types so `?` works
/// inside sources, sinks and transformers.
///
/// ```rust
/// use conduit_streams::{impl_stream_error_from, StreamError};
///
/// #[derive(Debug)]
/// struct ParseError;
/// impl std::fmt::Display for ParseError {
///     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
///         write!(f, "parse error")
///     }
/// }
/// impl std::error::Error for ParseError {}
///
/// impl_stream_error_from!(ParseError);
///
/// fn parse() -> Result<(), StreamError> {
///     Err(ParseError)?;
///     Ok(())
/// }
/// assert!(parse().is_err());
/// ```
#[macro_export]
macro_rules! impl_stream_error_from {
    ($($error_type:ty),* $(,)?) => {
        $(
            impl From<$error_type> for $crate::StreamError {
                fn from(e: $error_type) -> Self {
                    $crate::StreamError::Other(std::sync::Arc::new(e))
                }
            }
        )*
    };
}
