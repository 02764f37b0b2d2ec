//! Protobuf codec for GTFS Realtime feeds with NYCT extensions.

use anyhow::{Result, bail};
use prost::Message;

use crate::gtfs_rt::{FeedHeader, FeedMessage};

/// The only NYCT subway header version understood.
pub const NYCT_SUBWAY_VERSION: &str = "1.0";

/// Decodes a protobuf-encoded GTFS-RT [`FeedMessage`] from raw bytes.
///
/// # Errors
///
/// Returns an error if the bytes are not valid protobuf for a `FeedMessage`
/// or the header is not supported.
pub fn parse_feed(bytes: &[u8]) -> Result<FeedMessage> {
    let feed = FeedMessage::decode(bytes)?;
    validate_header(&feed.header)?;
    Ok(feed)
}

pub fn encode_feed(feed: &FeedMessage) -> Vec<u8> {
    feed.encode_to_vec()
}

/// Rejects NYCT headers of a version other than [`NYCT_SUBWAY_VERSION`].
pub fn validate_header(header: &FeedHeader) -> Result<()> {
    if let Some(nyct) = &header.nyct_feed_header {
        if nyct.nyct_subway_version != NYCT_SUBWAY_VERSION {
            bail!(
                "unsupported NYCT subway version {:?}, expected {NYCT_SUBWAY_VERSION}",
                nyct.nyct_subway_version
            );
        }
    }
    Ok(())
}
