//! HTTP fetcher and manifest cache.

pub mod cache;
pub mod fetcher;
