use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};

/// Read and write deadlines of one connection. `None` means no timeout.
///
/// Setting a deadline wakes a read that is already blocked, so it re-arms
/// its timer with the new value.
pub struct Deadlines {
    read: Mutex<Option<Instant>>,
    write: Mutex<Option<Instant>>,
    notify: Sender<()>,
    changed: Receiver<()>,
}

impl Deadlines {
    pub fn new() -> Self {
        let (notify, changed) = crossbeam_channel::bounded(1);
        Deadlines {
            read: Mutex::new(None),
            write: Mutex::new(None),
            notify,
            changed,
        }
    }

    pub fn read(&self) -> Option<Instant> {
        *self.read.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> Option<Instant> {
        *self.write.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_read(&self, deadline: Option<Instant>) {
        *self.read.lock().unwrap_or_else(PoisonError::into_inner) = deadline;
        let _ = self.notify.try_send(());
    }

    pub fn set_write(&self, deadline: Option<Instant>) {
        *self.write.lock().unwrap_or_else(PoisonError::into_inner) = deadline;
    }

    /// Ready whenever a deadline changed since the last wait.
    pub fn changed(&self) -> &Receiver<()> {
        &self.changed
    }
}

impl Default for Deadlines {
    fn default() -> Self {
        Self::new()
    }
}

pub fn expired(deadline: Option<Instant>) -> bool {
    matches!(deadline, Some(d) if d <= Instant::now())
}
