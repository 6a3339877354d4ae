//! Command dispatch: bridges CLI args -> session -> output formatting.

pub mod config_cmd;
pub mod devices;
pub mod metrics;
pub mod poll;
pub mod status;
pub mod util;
pub mod watch;

use crate::cli::{Command, GlobalOpts};
use crate::config::Session;
use crate::error::CliError;

/// Dispatch a server-bound command to the appropriate handler.
pub async fn dispatch(cmd: Command, session: &Session, global: &GlobalOpts) -> Result<(), CliError> {
    match cmd {
        Command::Watch(args) => watch::handle(session, &args, global).await,
        Command::Poll(args) => poll::handle(session, &args, global).await,
        Command::Latest(args) => metrics::latest(session, &args, global).await,
        Command::History(args) => metrics::history(session, &args, global),
        Command::Devices(args) => devices::list(session, &args, global).await,
        Command::Toggle(args) => devices::toggle(session, &args, global).await,
        Command::Status => status::handle(session, global).await,
        // Config and Completions are handled before dispatch
        Command::Config(_) | Command::Completions(_) => Err(CliError::Internal(
            "command does not need a server session".into(),
        )),
    }
}
