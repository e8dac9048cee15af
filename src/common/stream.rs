//! Stream abstraction
//!
//! Unified stream type for all layers to operate on.
//! Proxy negotiation, the secure transport and the socket client all work
//! against this boxed abstraction, never against raw TCP directly.

use tokio::io::{AsyncRead, AsyncWrite};

/// The core stream type used throughout the crate.
/// All layers operate on this unified abstraction.
pub type Stream = Box<dyn AsyncReadWrite + Unpin + Send>;

/// Combined trait for async read + write
pub trait AsyncReadWrite: AsyncRead + AsyncWrite {}

impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

/// Trait for types that can be converted into a Stream
pub trait IntoStream {
    fn into_stream(self) -> Stream;
}

impl<T> IntoStream for T
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn into_stream(self) -> Stream {
        Box::new(self)
    }
}
