//! Public API implementation.
//!
//! Each submodule contains `impl MediaCache` blocks. The struct itself lives in
//! `lib.rs`.

mod builder;
mod cache;
mod maintenance;

pub use builder::MediaCacheBuilder;
pub use cache::RegisteredFile;
pub use maintenance::ReconcileReport;
