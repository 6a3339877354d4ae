// Loader seam for bundled application assets (TLS client identities).

use std::io;
use std::path::{Path, PathBuf};

/// Source of named binary assets.
pub trait AssetSource: Send + Sync {
    fn load(&self, name: &str) -> io::Result<Vec<u8>>;
}

/// Assets stored as plain files in one directory.
#[derive(Debug, Clone)]
pub struct DirAssets {
    root: PathBuf,
}

impl DirAssets {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl AssetSource for DirAssets {
    fn load(&self, name: &str) -> io::Result<Vec<u8>> {
        // Asset names are flat file names; refuse anything that walks out.
        if name.contains(['/', '\\']) || name == ".." {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid asset name: {name}"),
            ));
        }
        std::fs::read(self.root.join(name))
    }
}
