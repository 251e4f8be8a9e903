//! Host callbacks.

use crate::error::Error;

/// Receives the events of a [`Connection`](crate::Connection).
///
/// Callbacks run on the connection's own tasks: `on_message` from the reader
/// task (so lines arrive in order), the others from whichever task drove
/// the transition. They should return quickly; hand long work off to
/// another task.
pub trait Handler: Send + Sync + 'static {
    /// The transport is up and the heartbeat is running.
    fn on_connect(&self) {}

    /// One decoded line, without its terminator.
    fn on_message(&self, line: &str);

    /// The connection reached its final state. Called exactly once.
    fn on_close(&self) {}

    /// Something failed. Always followed by `on_close`.
    fn on_error(&self, error: &Error) {
        let _ = error;
    }
}
