// Tether - resilient remote operations for Rust
//
// Retry with backoff, per-class circuit breaking, connectivity monitoring,
// a durable offline queue and stale-while-offline caching around any async
// remote call.

// Re-export core functionality
pub use tether_core::*;

// Re-export the HTTP transport
#[cfg(feature = "http")]
pub use tether_http;

#[cfg(feature = "http")]
pub use tether_http::{HttpProbe, RemoteApi, RemoteApiConfig};

// Prelude for common imports
pub mod prelude {
    pub use tether_core::prelude::*;

    #[cfg(feature = "http")]
    pub use tether_http::{HttpProbe, RemoteApi, RemoteApiConfig};
}
