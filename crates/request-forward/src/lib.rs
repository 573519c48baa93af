//! Forward an in-flight axum request to another URL and stream the response back.
//!
//! Handlers take a [`Forwarder`] extractor and call [`Forwarder::forward`]
//! with an absolute URL or a path. The inbound method, headers, query string
//! and body are used unless overridden by [`ForwardOptions`] or by the
//! process-wide [`DefaultOptions`]. [`all`] builds a layer that forwards
//! requests the router answered with 404 to the configured base URL.

pub mod config;
pub mod error;
pub mod inbound;
pub mod options;
pub mod proxy;
pub mod server;
pub mod translate;

pub use error::ForwardError;
pub use inbound::{ContentKind, FileDescriptor, FileEntry, InboundRequest, ParsedBody};
pub use options::{resolve, DefaultOptions, FormPart, ForwardOptions, OutboundBody};
pub use proxy::fallback::{all, FallbackLayer};
pub use proxy::forwarder::{is_handled, ForwardState, Forwarder, Handled};
