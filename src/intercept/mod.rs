mod context;
mod filter;
mod handler;
mod url;

pub use context::{InterceptorContext, RequestState, ResponseState};
pub use handler::InterceptedDispatch;

use crate::bloom::BloomFilter;
use crate::config::{CompiledOptions, TrafficInterceptorOptions};
use crate::dispatch::{DispatchHandler, DispatchOptions};
use crate::error::InterceptorError;
use crate::mirror::MirrorClient;
use std::sync::{Arc, Mutex};

/// State shared by every transaction of one interceptor: the compiled
/// options, the identity Bloom filter, and the pooled collector client.
pub(crate) struct Shared {
    pub options: Arc<CompiledOptions>,
    pub bloom: Mutex<BloomFilter>,
    pub mirror: MirrorClient,
}

/// The interceptor factory. Validates options once, then composes host
/// dispatch handlers into mirrored ones, one transaction at a time. Its
/// lifetime equals the host dispatcher it is installed into.
pub struct TrafficInterceptor {
    shared: Arc<Shared>,
}

impl TrafficInterceptor {
    pub fn new(options: TrafficInterceptorOptions) -> Result<Self, InterceptorError> {
        let compiled = options.compile()?;
        let mirror = MirrorClient::new(&compiled.raw.traffic_inspector)?;
        let bloom = Mutex::new(BloomFilter::new(
            compiled.raw.bloom_filter.size,
            compiled.raw.bloom_filter.error_rate,
        ));

        Ok(Self {
            shared: Arc::new(Shared {
                options: Arc::new(compiled),
                bloom,
                mirror,
            }),
        })
    }

    /// Compose a host handler for one outbound transaction. The returned
    /// handler observes the lifecycle, mirrors what the filters admit,
    /// and forwards every callback to `inner` untouched.
    pub fn wrap<H: DispatchHandler>(
        &self,
        inner: H,
        dispatch: DispatchOptions,
    ) -> InterceptedDispatch<H> {
        InterceptedDispatch::new(inner, dispatch, self.shared.clone())
    }
}
