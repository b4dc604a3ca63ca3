use std::fmt;

use serde::{Deserialize, Serialize};

/// Number of uids reserved per user profile; `uid / PER_USER_RANGE` is the
/// profile an app uid belongs to.
const PER_USER_RANGE: u32 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationClass {
    Internal,
    External,
    Unspecified,
}

impl LocationClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Internal => "internal",
            Self::External => "external",
            Self::Unspecified => "unspecified",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "internal" => Some(Self::Internal),
            "external" => Some(Self::External),
            "unspecified" | "auto" => Some(Self::Unspecified),
            _ => None,
        }
    }

    /// Infers where an installed artifact lives from its absolute path.
    pub fn from_install_path(path: &str) -> Self {
        let path = path.trim();
        if path.starts_with("/mnt/asec/")
            || path.starts_with("/mnt/expand/")
            || path.starts_with("/mnt/sdcard/")
            || path.starts_with("/storage/")
        {
            return Self::External;
        }
        if ["/data/", "/system/", "/product/"]
            .iter()
            .any(|prefix| path.starts_with(prefix))
        {
            return Self::Internal;
        }
        Self::Unspecified
    }

    /// Installer flag that requests this location, `None` lets the host pick.
    pub fn install_flag(self) -> Option<&'static str> {
        match self {
            Self::Internal => Some("-f"),
            Self::External => Some("-s"),
            Self::Unspecified => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserProfileId(pub u32);

impl UserProfileId {
    pub const PRIMARY: Self = Self(0);

    pub fn is_primary(self) -> bool {
        self == Self::PRIMARY
    }
}

impl Default for UserProfileId {
    fn default() -> Self {
        Self::PRIMARY
    }
}

impl fmt::Display for UserProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(pub u32);

impl OwnerId {
    /// Owner of an app's data inside one user profile, from its per-app id.
    /// `None` when the profile id is too large to hold a uid range.
    pub fn for_profile(app_id: u32, user: UserProfileId) -> Option<Self> {
        user.0
            .checked_mul(PER_USER_RANGE)?
            .checked_add(app_id % PER_USER_RANGE)
            .map(Self)
    }

    pub fn user_profile(self) -> UserProfileId {
        UserProfileId(self.0 / PER_USER_RANGE)
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Host-side state of one installed package at the moment it was queried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledPackageFacts {
    pub install_paths: Vec<String>,
    pub location_class: LocationClass,
    pub user_profile_id: UserProfileId,
    pub user_profile_detected: bool,
    pub owner_id: Option<OwnerId>,
}

impl InstalledPackageFacts {
    pub fn install_path(&self) -> Option<&str> {
        self.install_paths.first().map(String::as_str)
    }

    /// True when the installed package is made of several artifacts.
    pub fn is_split(&self) -> bool {
        self.install_paths.len() > 1
    }
}
