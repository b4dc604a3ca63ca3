use serde::Serialize;

use crate::PackageIdentity;

const UPDATE_INCOMPATIBLE: &str = "INSTALL_FAILED_UPDATE_INCOMPATIBLE";
const SIGNATURES_DO_NOT_MATCH: &str = "signatures do not match";
const EXISTING_PACKAGE: &str = "existing package";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    SignatureConflict,
    OtherFailure,
}

/// Maps the captured output of a failed install to a failure category.
///
/// Matching runs over the joined output, so marker position and unrelated
/// lines do not matter. Empty output is `OtherFailure`.
pub fn classify<S: AsRef<str>>(output_lines: &[S]) -> FailureCategory {
    let joined = join_lines(output_lines);
    let lower = joined.to_ascii_lowercase();

    if joined.contains(UPDATE_INCOMPATIBLE) || lower.contains(SIGNATURES_DO_NOT_MATCH) {
        return FailureCategory::SignatureConflict;
    }
    FailureCategory::OtherFailure
}

/// Package named by an `Existing package <id> signatures do not match`
/// message, when the installer printed one.
pub fn conflicting_identity<S: AsRef<str>>(output_lines: &[S]) -> Option<PackageIdentity> {
    let joined = join_lines(output_lines);
    let lower = joined.to_ascii_lowercase();
    let start = lower.find(EXISTING_PACKAGE)? + EXISTING_PACKAGE.len();
    let candidate = joined[start..].split_whitespace().next()?;
    PackageIdentity::parse(candidate).ok()
}

fn join_lines<S: AsRef<str>>(output_lines: &[S]) -> String {
    output_lines
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join("\n")
}
