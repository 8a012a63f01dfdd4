//! `rd://` URLs: shareable handles to published manifests.
//!
//! Layout: `rd://<host>/<version>/<file-size>/<file-name>/<timestamp>/<manifest-hash>`,
//! with the file name percent-encoded so it cannot introduce extra segments.

use std::fmt;
use std::str::FromStr;

use crate::error::RandomFsError;
use crate::fingerprint::BlockHash;
use crate::manifest::PROTOCOL_VERSION;

/// URL scheme prefix.
pub const SCHEME: &str = "rd";
/// Host segment written by [`crate::engine::StorageEngine::publish_manifest`].
pub const DEFAULT_HOST: &str = "randomfs";

/// Parsed `rd://` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RandomUrl {
    /// Host segment
    pub host: String,
    /// Manifest protocol version
    pub version: String,
    /// Original file size in bytes
    pub file_size: u64,
    /// Original file name, decoded
    pub file_name: String,
    /// Unix timestamp of publication
    pub timestamp: u64,
    /// Content store hash of the serialized manifest
    pub manifest_hash: BlockHash,
}

impl RandomUrl {
    /// URL for a manifest published under the current protocol version.
    pub fn new(file_name: impl Into<String>, file_size: u64, timestamp: u64, manifest_hash: BlockHash) -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            version: PROTOCOL_VERSION.to_string(),
            file_size,
            file_name: file_name.into(),
            timestamp,
            manifest_hash,
        }
    }
}

impl fmt::Display for RandomUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{SCHEME}://{}/{}/{}/{}/{}/{}",
            self.host,
            self.version,
            self.file_size,
            urlencoding::encode(&self.file_name),
            self.timestamp,
            self.manifest_hash
        )
    }
}

fn invalid(msg: impl Into<String>) -> RandomFsError {
    RandomFsError::InvalidUrl(msg.into())
}

impl FromStr for RandomUrl {
    type Err = RandomFsError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let rest = raw
            .strip_prefix(SCHEME)
            .and_then(|r| r.strip_prefix("://"))
            .ok_or_else(|| invalid(format!("expected {SCHEME}:// scheme in {raw:?}")))?;

        let parts: Vec<&str> = rest.trim_end_matches('/').split('/').collect();
        let [host, version, size, name, timestamp, hash] = parts.as_slice() else {
            return Err(invalid(format!(
                "expected 6 path segments, found {} in {raw:?}",
                parts.len()
            )));
        };
        // name may be empty; stores accept unnamed files
        if host.is_empty() || version.is_empty() {
            return Err(invalid(format!("empty segment in {raw:?}")));
        }

        let file_size = size
            .parse::<u64>()
            .map_err(|e| invalid(format!("bad file size {size:?}: {e}")))?;
        let timestamp = timestamp
            .parse::<u64>()
            .map_err(|e| invalid(format!("bad timestamp {timestamp:?}: {e}")))?;
        let manifest_hash = hash
            .parse::<BlockHash>()
            .map_err(|e| invalid(format!("bad manifest hash {hash:?}: {e}")))?;
        let file_name = urlencoding::decode(name)
            .map_err(|e| invalid(format!("bad file name {name:?}: {e}")))?
            .into_owned();

        Ok(Self {
            host: host.to_string(),
            version: version.to_string(),
            file_size,
            file_name,
            timestamp,
            manifest_hash,
        })
    }
}
