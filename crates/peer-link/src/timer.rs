use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::manager::Command;

/// One-shot timer that posts a command back to the manager. Dropping the
/// guard cancels it.
#[derive(Debug)]
pub(crate) struct Timer {
    handle: AbortHandle,
}

impl Timer {
    pub(crate) fn schedule(
        commands: &mpsc::UnboundedSender<Command>,
        delay: Duration,
        command: Command,
    ) -> Self {
        let commands = commands.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = commands.send(command);
        });
        Self {
            handle: task.abort_handle(),
        }
    }

    pub(crate) fn cancel(self) {
        drop(self);
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
