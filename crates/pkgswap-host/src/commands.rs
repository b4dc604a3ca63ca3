use std::path::Path;

use pkgswap_core::{LocationClass, PackageIdentity, UserProfileId};

/// Single-quotes a value for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

pub(crate) fn quote_path(path: &Path) -> String {
    shell_quote(&path.display().to_string())
}

/// Install allowing downgrade and replacement of an existing package, pinned
/// to a location class and user profile when those are known.
pub fn build_install_command(
    archive_path: &Path,
    location: LocationClass,
    user: Option<UserProfileId>,
) -> String {
    let mut command = String::from("pm install -d -r");
    if let Some(flag) = location.install_flag() {
        command.push(' ');
        command.push_str(flag);
    }
    if let Some(user) = user {
        command.push_str(&format!(" --user {user}"));
    }
    command.push(' ');
    command.push_str(&quote_path(archive_path));
    command
}

pub fn build_uninstall_command(identity: &PackageIdentity) -> String {
    format!("pm uninstall {identity}")
}

pub fn build_force_stop_command(identity: &PackageIdentity) -> String {
    format!("am force-stop {identity}")
}

pub(crate) fn build_path_query(identity: &PackageIdentity) -> String {
    format!("pm path {identity}")
}

pub(crate) fn build_dumpsys_query(identity: &PackageIdentity) -> String {
    format!("dumpsys package {identity}")
}

pub(crate) fn build_uid_listing_query(identity: &PackageIdentity) -> String {
    format!("pm list packages -U {identity}")
}

pub(crate) fn build_badging_command(tool: &str, archive_path: &Path) -> String {
    format!("{tool} dump badging {}", quote_path(archive_path))
}
