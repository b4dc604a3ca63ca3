use std::path::{Path, PathBuf};

use pkgswap_core::{PackageIdentity, UserProfileId};

pub const DEFAULT_DATA_ROOT: &str = "/data/data";
pub const DEFAULT_USER_DATA_ROOT: &str = "/data/user";
pub const DEFAULT_EXTERNAL_DATA_ROOT: &str = "/storage/emulated";
pub const DEFAULT_STAGING_ROOT: &str = "/data/local/tmp/pkgswap";

/// Where private package data lives on the host, and where it is staged
/// while a package is being replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostLayout {
    data_root: PathBuf,
    user_data_root: PathBuf,
    external_data_root: PathBuf,
    staging_root: PathBuf,
}

impl Default for HostLayout {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from(DEFAULT_DATA_ROOT),
            user_data_root: PathBuf::from(DEFAULT_USER_DATA_ROOT),
            external_data_root: PathBuf::from(DEFAULT_EXTERNAL_DATA_ROOT),
            staging_root: PathBuf::from(DEFAULT_STAGING_ROOT),
        }
    }
}

impl HostLayout {
    pub fn new(
        data_root: impl Into<PathBuf>,
        user_data_root: impl Into<PathBuf>,
        external_data_root: impl Into<PathBuf>,
        staging_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            data_root: data_root.into(),
            user_data_root: user_data_root.into(),
            external_data_root: external_data_root.into(),
            staging_root: staging_root.into(),
        }
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    pub fn user_data_root(&self) -> &Path {
        &self.user_data_root
    }

    pub fn external_data_root(&self) -> &Path {
        &self.external_data_root
    }

    pub fn staging_root(&self) -> &Path {
        &self.staging_root
    }

    pub fn data_dir(&self, identity: &PackageIdentity, user: UserProfileId) -> PathBuf {
        if user.is_primary() {
            return self.data_root.join(identity.as_str());
        }
        self.user_data_root
            .join(user.to_string())
            .join(identity.as_str())
    }

    pub fn external_data_dir(&self, identity: &PackageIdentity, user: UserProfileId) -> PathBuf {
        self.external_data_root
            .join(user.to_string())
            .join("Android")
            .join("data")
            .join(identity.as_str())
    }

    /// Staging directory reserved for one identity; a leftover from an
    /// aborted run lands on the same path.
    pub fn staging_dir(&self, identity: &PackageIdentity) -> PathBuf {
        self.staging_root.join(identity.as_str())
    }

    pub fn staged_data_dir(&self, identity: &PackageIdentity) -> PathBuf {
        self.staging_dir(identity).join("data")
    }

    pub fn staged_external_dir(&self, identity: &PackageIdentity) -> PathBuf {
        self.staging_dir(identity).join("external")
    }
}
