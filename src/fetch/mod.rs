//! Upstream feed acquisition: HTTP client seam and the fetch-decode-publish
//! adapter that turns GTFS-RT protobuf snapshots into bus envelopes.

mod feed;
mod http;

pub use feed::FeedFetcher;
pub use http::{BasicClient, HttpClient, fetch_bytes};
