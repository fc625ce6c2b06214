use std::{error::Error, fmt, sync::Arc};

/// Error carried in stream completions and stored by errored controllers.
///
/// Stored errors are cloned out to every consumer that observes them, so the
/// same reason is reported however many times an errored stream is poked.
#[derive(Debug, Clone)]
pub enum StreamError {
    /// The operation is not legal in the controller's current state.
    InvalidState(&'static str),
    /// A close was requested while one is already queued or in flight.
    CloseAlreadyRequested,
    /// The stream is closed.
    Closed,
    /// A close is in progress; no further writes are accepted.
    Closing,
    /// The operation or pipe was cancelled.
    Canceled,
    /// The writable side was torn down via abort.
    Aborted(Option<String>),
    /// The queuing strategy produced a negative, NaN or infinite size.
    InvalidSize(f64),
    /// The stream is locked to another reader or writer.
    Locked,
    /// The stream task was dropped while an operation was pending.
    TaskDropped,
    /// A source, sink or transformer algorithm failed.
    Other(Arc<dyn Error + Send + Sync>),
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
}

impl From<&str> for StreamError {
    fn from(s: &str) -> Self {
        #[derive(Debug)]
        struct SimpleError(String);
        impl fmt::Display for SimpleError {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
        impl Error for SimpleError {}
        StreamError::Other(Arc::new(SimpleError(s.to_string())))
    }
}

impl From<String> for StreamError {
    fn from(s: String) -> Self {
        StreamError::from(s.as_str())
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

/// Adds direct `From` implementations for user error types, so `?` works
/// without `.map_err(StreamError::other)`.
///
/// # Example
/// ```ignore
/// impl_stream_error_from!(serde_json::Error, my_crate::Error);
/// ```
#[macro_export]
macro_rules! impl_stream_error_from {
    ($($error_type:ty),* $(,)?) => {
        $(
            impl From<$error_type> for $crate::streams::error::StreamError {
                fn from(e: $error_type) -> Self {
                    $crate::streams::error::StreamError::Other(std::sync::Arc::new(e))
                }
            }
        )*
    };
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::InvalidState(what) => write!(f, "Invalid state: {}", what),
            StreamError::CloseAlreadyRequested => {
                write!(f, "A close is already queued or in flight")
            }
            StreamError::Closed => write!(f, "Stream is closed"),
            StreamError::Closing => write!(f, "Stream is closing"),
            StreamError::Canceled => write!(f, "Stream operation was canceled"),
            StreamError::Aborted(Some(reason)) => write!(f, "Stream was aborted: {}", reason),
            StreamError::Aborted(None) => write!(f, "Stream was aborted"),
            StreamError::InvalidSize(size) => {
                write!(f, "Queuing strategy returned an invalid chunk size: {}", size)
            }
            StreamError::Locked => write!(f, "Stream already locked"),
            StreamError::TaskDropped => write!(f, "Stream task was dropped"),
            StreamError::Other(err) => write!(f, "{}", err),
        }
    }
}

impl Error for StreamError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StreamError::Other(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_conversions_work() {
        let _: StreamError = "error message".into();
        let _: StreamError = String::from("error").into();

        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "io error");
        let _: StreamError = io_err.into();

        #[derive(Debug)]
        struct CustomError;
        impl fmt::Display for CustomError {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "custom error")
            }
        }
        impl Error for CustomError {}

        let _: StreamError = StreamError::other(CustomError);
    }

    #[test]
    fn question_mark_works() -> Result<(), Box<dyn Error>> {
        fn returns_stream_error() -> Result<(), StreamError> {
            Err("stream error".into())
        }

        assert!(returns_stream_error().is_err());
        Ok(())
    }

    #[test]
    fn from_macro_enables_question_mark() {
        #[derive(Debug)]
        struct UserError(String);
        impl fmt::Display for UserError {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "User error: {}", self.0)
            }
        }
        impl Error for UserError {}

        impl_stream_error_from!(UserError);

        fn user_function() -> Result<(), StreamError> {
            Err(UserError("something went wrong".to_string()))?
        }

        assert!(user_function().is_err());
    }

    #[test]
    fn cloned_errors_display_the_same_reason() {
        let err = StreamError::Aborted(Some("disk full".into()));
        assert_eq!(err.to_string(), err.clone().to_string());
    }
}
