//! Manifest registry: file id to manifest, the perfect-deduplication path.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::fingerprint::BlockHash;
use crate::manifest::FileManifest;

/// Outcome of [`ManifestRegistry::register`].
#[derive(Debug, Clone)]
pub enum Registration {
    /// The manifest was new and is now registered
    Registered(Arc<FileManifest>),
    /// A manifest with the same file id already existed; its popularity was bumped
    Existing(Arc<FileManifest>),
}

impl Registration {
    /// The registered manifest, whichever branch was taken.
    pub fn manifest(&self) -> &Arc<FileManifest> {
        match self {
            Registration::Registered(m) | Registration::Existing(m) => m,
        }
    }

    /// True if the manifest was already present.
    pub fn was_existing(&self) -> bool {
        matches!(self, Registration::Existing(_))
    }
}

/// Thread-safe manifest registry. Registration is an atomic check-then-act,
/// so concurrent first-time stores of one file id agree on a single winner.
#[derive(Debug, Default)]
pub struct ManifestRegistry {
    manifests: RwLock<HashMap<BlockHash, Arc<FileManifest>>>,
}

impl ManifestRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Find the manifest for `file_id`.
    pub fn lookup(&self, file_id: &BlockHash) -> Option<Arc<FileManifest>> {
        self.manifests.read().get(file_id).cloned()
    }

    /// Register `manifest`, or bump the popularity of the one already
    /// registered under its file id.
    pub fn register(&self, manifest: FileManifest) -> Registration {
        let mut manifests = self.manifests.write();
        if let Some(existing) = manifests.get(&manifest.file_id) {
            let popularity = existing.bump_popularity();
            debug!(file_id = %manifest.file_id.short(), popularity, "manifest already registered");
            return Registration::Existing(Arc::clone(existing));
        }
        let manifest = Arc::new(manifest);
        manifests.insert(manifest.file_id, Arc::clone(&manifest));
        Registration::Registered(manifest)
    }

    /// Insert `manifest` unless its file id is present. Never bumps popularity.
    pub fn import(&self, manifest: FileManifest) -> Arc<FileManifest> {
        let mut manifests = self.manifests.write();
        Arc::clone(
            manifests
                .entry(manifest.file_id)
                .or_insert_with(|| Arc::new(manifest)),
        )
    }

    /// Number of registered manifests.
    pub fn len(&self) -> usize {
        self.manifests.read().len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.manifests.read().is_empty()
    }

    /// All registered file ids.
    pub fn file_ids(&self) -> Vec<BlockHash> {
        self.manifests.read().keys().copied().collect()
    }
}
