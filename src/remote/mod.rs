//! Remote Command Channel
//!
//! Executes a named action on another node's host by invoking this binary
//! there, and parses the single `--key=value` reply line. The channel itself
//! is a byte transport; parsing and enum mapping happen here, on the caller's
//! side. Empty output is "host unreachable", never "nothing to report".

mod actions;
mod channel;
mod optformat;

pub use actions::{
    shell_quote, split_command_line, ActionReply, CheckReply, DaemonReply, RemoteAction,
    RemoteInvocation, ShutdownReply, ShutdownState,
};
pub use channel::{RemoteChannel, SshChannel};
pub use optformat::{OptReply, OptWriter};
