// Copyright (C) 2025 The groundseg Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Storage manager contract and a local filesystem implementation.
//!
//! Locations are plain strings as seen by the processors on the facility.
//! With [`PosixStorage`] they are absolute paths under a shared root, laid
//! out as:
//!
//! ```text
//! <root>/<facility>/joborders/<descriptor>
//! <root>/<facility>/products/<product class>/<file name>
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use groundseg_core::Product;
use thiserror::Error;
use tracing::debug;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A name would escape its directory.
    #[error("invalid storage path component '{0}'")]
    InvalidPath(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// What the planner needs from the storage manager.
#[async_trait]
pub trait StorageManager: Send + Sync {
    /// Store a job order descriptor for `facility` and return its location.
    /// Storing identical bytes under the same name again is harmless.
    async fn put_descriptor(&self, facility: &str, name: &str, bytes: &[u8]) -> Result<String>;

    async fn file_exists(&self, location: &str) -> Result<bool>;

    /// Location of a catalogued product on its facility.
    fn product_path(&self, product: &Product) -> String;

    /// Directory a processor writes products of `product_class` to.
    fn output_directory(&self, facility: &str, product_class: &str) -> String;
}

/// Storage on a directory tree shared with the facilities.
#[derive(Debug, Clone)]
pub struct PosixStorage {
    root: PathBuf,
}

impl PosixStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn facility_dir(&self, facility: &str) -> PathBuf {
        self.root.join(facility)
    }
}

fn component(name: &str) -> Result<&str> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(StorageError::InvalidPath(name.to_string()));
    }
    Ok(name)
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[async_trait]
impl StorageManager for PosixStorage {
    async fn put_descriptor(&self, facility: &str, name: &str, bytes: &[u8]) -> Result<String> {
        let dir = self.facility_dir(component(facility)?).join("joborders");
        tokio::fs::create_dir_all(&dir).await.map_err(io_error(&dir))?;

        let path = dir.join(component(name)?);
        tokio::fs::write(&path, bytes).await.map_err(io_error(&path))?;

        debug!(path = %path.display(), size = bytes.len(), "Job order stored");
        Ok(path.display().to_string())
    }

    async fn file_exists(&self, location: &str) -> Result<bool> {
        let path = Path::new(location);
        tokio::fs::try_exists(path).await.map_err(io_error(path))
    }

    fn product_path(&self, product: &Product) -> String {
        format!(
            "{}/{}",
            self.output_directory(&product.facility, &product.product_class),
            product.file_name
        )
    }

    fn output_directory(&self, facility: &str, product_class: &str) -> String {
        self.facility_dir(facility)
            .join("products")
            .join(product_class)
            .display()
            .to_string()
    }
}
