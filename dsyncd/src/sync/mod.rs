pub mod backoff;
pub mod content_hash;
pub mod download;
pub mod engine;
pub mod entry;
pub mod feed;
pub mod paths;
pub mod remote;
pub mod store;
pub mod tracker;
pub mod upload;
pub mod watcher;

#[cfg(test)]
pub(crate) mod test_support;
