use std::fmt;

use thiserror::Error;

/// Returned by [`Queue::try_enqueue`](crate::structures::Queue::try_enqueue) when a node could
/// not be allocated. The value that was being enqueued is handed back untouched.
#[derive(Error, PartialEq, Eq)]
#[error("failed to allocate a queue node")]
pub struct AllocError<T>(pub T);

impl<T> AllocError<T> {
    /// Take back the value that could not be enqueued.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for AllocError<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AllocError").finish_non_exhaustive()
    }
}
