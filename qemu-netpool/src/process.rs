//! Child process signalling.

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

/// Send `SIGKILL` to a single process by pid.
///
/// `dnsmasq` is spawned directly rather than through a shell, so there is
/// no process group to reap — a plain `kill` is enough.
pub(crate) fn kill(pid: i32) -> Result<(), nix::Error> {
    signal::kill(Pid::from_raw(pid), Signal::SIGKILL)
}
