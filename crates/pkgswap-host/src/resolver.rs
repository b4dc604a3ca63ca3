use std::path::Path;

use pkgswap_core::{
    InstalledPackageFacts, LocationClass, OwnerId, PackageIdentity, UserProfileId,
};
use tracing::{debug, warn};

use crate::commands::{
    build_badging_command, build_dumpsys_query, build_path_query, build_uid_listing_query,
};
use crate::CommandRunner;

pub const DEFAULT_ARCHIVE_TOOLS: &[&str] = &["aapt2", "aapt"];

/// Reads package facts from the host through the command runner.
///
/// Every query is best-effort: a failing command yields no lines and the
/// affected fact falls back to its default.
pub struct MetadataResolver<'a, R: ?Sized> {
    runner: &'a R,
    archive_tools: Vec<String>,
}

impl<'a, R> MetadataResolver<'a, R>
where
    R: CommandRunner + ?Sized,
{
    pub fn new(runner: &'a R) -> Self {
        Self {
            runner,
            archive_tools: DEFAULT_ARCHIVE_TOOLS
                .iter()
                .map(|tool| tool.to_string())
                .collect(),
        }
    }

    pub fn with_archive_tools(mut self, archive_tools: Vec<String>) -> Self {
        self.archive_tools = archive_tools;
        self
    }

    /// Identity declared in the archive's manifest. Tools are tried in order
    /// until one prints a parsable package line.
    pub fn identity_of(&self, archive_path: &Path) -> Option<PackageIdentity> {
        for tool in &self.archive_tools {
            let lines = self.query_lines(build_badging_command(tool, archive_path));
            if let Some(identity) = parse_badging_identity(&lines) {
                debug!(%tool, %identity, "resolved archive identity");
                return Some(identity);
            }
        }
        warn!(archive = %archive_path.display(), "no archive tool reported a package identity");
        None
    }

    /// Facts about the installed package, or `None` when the host does not
    /// know the package at all.
    pub fn facts_of(&self, identity: &PackageIdentity) -> Option<InstalledPackageFacts> {
        let install_paths = parse_package_paths(&self.query_lines(build_path_query(identity)));
        let dumpsys = self.query_lines(build_dumpsys_query(identity));
        let block = package_block(&dumpsys, identity);

        let mut app_id = parse_app_id(block);
        let mut detected_user = parse_installed_users(block).into_iter().min();
        if app_id.is_none() {
            let listed_uid =
                parse_listed_uid(&self.query_lines(build_uid_listing_query(identity)), identity);
            app_id = listed_uid;
            detected_user =
                detected_user.or_else(|| listed_uid.map(|uid| OwnerId(uid).user_profile()));
        }

        if install_paths.is_empty() && app_id.is_none() {
            debug!(%identity, "package is not known to the host");
            return None;
        }

        let user_profile_detected = detected_user.is_some();
        let user_profile_id = detected_user.unwrap_or_default();
        if !user_profile_detected {
            warn!(%identity, "user profile undetectable, assuming the primary profile");
        }

        let location_class = install_paths
            .first()
            .map(|path| LocationClass::from_install_path(path))
            .unwrap_or(LocationClass::Unspecified);
        if install_paths.is_empty() {
            warn!(%identity, "install path undetectable, location left unspecified");
        }

        Some(InstalledPackageFacts {
            install_paths,
            location_class,
            user_profile_id,
            user_profile_detected,
            owner_id: app_id.and_then(|id| OwnerId::for_profile(id, user_profile_id)),
        })
    }

    /// Current owner of the package's data for one profile.
    pub fn owner_id_of(&self, identity: &PackageIdentity, user: UserProfileId) -> Option<OwnerId> {
        let dumpsys = self.query_lines(build_dumpsys_query(identity));
        parse_app_id(package_block(&dumpsys, identity))
            .or_else(|| {
                let listing = self.query_lines(build_uid_listing_query(identity));
                parse_listed_uid(&listing, identity)
            })
            .and_then(|id| OwnerId::for_profile(id, user))
    }

    fn query_lines(&self, command: String) -> Vec<String> {
        match self.runner.execute(&[command.clone()]) {
            Ok(output) if output.success => output.output_lines,
            Ok(output) => {
                debug!(%command, output = %output.joined(), "metadata query failed");
                Vec::new()
            }
            Err(err) => {
                warn!(%command, "metadata query could not run: {err:#}");
                Vec::new()
            }
        }
    }
}

/// `package: name='com.example' versionCode='3' ...` from a badging dump.
pub(crate) fn parse_badging_identity(lines: &[String]) -> Option<PackageIdentity> {
    lines
        .iter()
        .map(|line| line.trim())
        .filter(|line| line.starts_with("package:"))
        .find_map(|line| {
            let rest = &line[line.find("name='")? + "name='".len()..];
            let name = &rest[..rest.find('\'')?];
            PackageIdentity::parse(name).ok()
        })
}

/// One artifact path per `package:` line; split installs print several.
pub(crate) fn parse_package_paths(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .filter_map(|line| line.trim().strip_prefix("package:"))
        .map(str::trim)
        .filter(|path| path.starts_with('/'))
        .map(str::to_string)
        .collect()
}

/// Lines of the `Package [<id>]` section of a package dump, or every line
/// when the dump has no such header.
pub(crate) fn package_block<'l>(lines: &'l [String], identity: &PackageIdentity) -> &'l [String] {
    let header = format!("Package [{identity}]");
    let Some(start) = lines.iter().position(|line| line.trim().starts_with(&header)) else {
        return lines;
    };
    let end = lines[start + 1..]
        .iter()
        .position(|line| line.trim().starts_with("Package ["))
        .map(|offset| start + 1 + offset)
        .unwrap_or(lines.len());
    &lines[start..end]
}

/// Per-app id from `userId=10123` (older dumps) or `appId=10123`.
pub(crate) fn parse_app_id(lines: &[String]) -> Option<u32> {
    for key in ["appId=", "userId="] {
        for line in lines {
            let trimmed = line.trim();
            if !trimmed.starts_with(key) {
                continue;
            }
            if let Some(value) = leading_number(&trimmed[key.len()..]) {
                return Some(value);
            }
        }
    }
    None
}

/// Profiles with a `User <n>: ... installed=true` row.
pub(crate) fn parse_installed_users(lines: &[String]) -> Vec<UserProfileId> {
    lines
        .iter()
        .filter_map(|line| {
            let rest = line.trim().strip_prefix("User ")?;
            let (id, state) = rest.split_once(':')?;
            if !state.split_whitespace().any(|field| field == "installed=true") {
                return None;
            }
            id.trim().parse().ok().map(UserProfileId)
        })
        .collect()
}

/// `package:com.example uid:10123` for exactly the requested identity.
pub(crate) fn parse_listed_uid(lines: &[String], identity: &PackageIdentity) -> Option<u32> {
    lines.iter().find_map(|line| {
        let mut fields = line.split_whitespace();
        let name = fields.next()?.strip_prefix("package:")?;
        if name != identity.as_str() {
            return None;
        }
        fields
            .find_map(|field| field.strip_prefix("uid:"))
            .and_then(leading_number)
    })
}

fn leading_number(value: &str) -> Option<u32> {
    let digits: String = value.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}
