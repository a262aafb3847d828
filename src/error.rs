use std::fmt;

#[derive(Debug)]
pub enum InterceptorError {
    /// Invalid interceptor options. Fatal at construction.
    Config(String),
    /// The collector answered a mirror POST with a non-2xx status.
    Collector(u16),
    /// Transport-level failure talking to the collector.
    Http(hyper_util::client::legacy::Error),
}

impl fmt::Display for InterceptorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterceptorError::Config(msg) => write!(f, "config error: {}", msg),
            InterceptorError::Collector(status) => {
                write!(f, "collector rejected mirror request: status {}", status)
            }
            InterceptorError::Http(e) => write!(f, "http error: {}", e),
        }
    }
}

impl std::error::Error for InterceptorError {}
