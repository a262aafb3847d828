//! Transparent client-side HTTP traffic observer.
//!
//! Composes with an outbound streaming dispatcher: every transaction
//! flows through the interceptor untouched while a filtered, deduplicated
//! subset is mirrored asynchronously to a remote collector (the Traffic
//! Inspector). The host's request and response are never altered, and
//! the host's response stream is never gated on the collector.
//!
//! ```no_run
//! use traffic_mirror::{TrafficInterceptor, TrafficInterceptorOptions};
//!
//! let mut options = TrafficInterceptorOptions::new("http://inspector.plt.local:9876");
//! options.labels.insert("app".to_string(), "checkout".to_string());
//! let interceptor = TrafficInterceptor::new(options).unwrap();
//! // per transaction: interceptor.wrap(host_handler, dispatch_options)
//! ```

pub mod bloom;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod hash;
mod intercept;
pub mod mirror;

pub use config::{
    BloomFilterConfig, ContextPredicate, KeepalivePoolConfig, StatusPredicate,
    TrafficInspectorConfig, TrafficInterceptorOptions,
};
pub use dispatch::{
    DispatchController, DispatchHandler, DispatchOptions, UpgradeStream,
};
pub use error::InterceptorError;
pub use intercept::{InterceptedDispatch, InterceptorContext, TrafficInterceptor};
