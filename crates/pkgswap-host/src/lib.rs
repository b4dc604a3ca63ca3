mod commands;
mod layout;
mod resolver;
mod runner;
mod snapshot;

pub use commands::{
    build_force_stop_command, build_install_command, build_uninstall_command, shell_quote,
};
pub use layout::HostLayout;
pub use resolver::{MetadataResolver, DEFAULT_ARCHIVE_TOOLS};
pub use runner::{CommandOutput, CommandRunner, ShellRunner};
pub use snapshot::{DataSnapshot, DataSnapshotManager, RestoreReport};
