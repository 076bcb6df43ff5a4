//! Remote object transport.
//!
//! The cache never talks HTTP directly; it hands a [`TransferRequest`] to a
//! [`RemoteTransport`] which writes the object's bytes to a local file.

mod http;
mod transport;

pub use http::HttpTransport;
pub use transport::{RemoteTransport, TransferRequest};
