//! Shared contexts and the cache that hands them out.

mod cache;
mod handle;

pub use cache::ContextCache;
pub use handle::Context;
