//! Background worker tasks
//!
//! Long operations (verify, build, flash) run on their own thread. The caller
//! receives progress events over a channel and collects the single terminal
//! result with [`Task::join`].

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

/// A running worker yielding events of type `E` and finishing with `T`
pub struct Task<E, T> {
    events: Receiver<E>,
    handle: JoinHandle<Result<T>>,
    cancel_flag: Arc<AtomicBool>,
}

impl<E, T> Task<E, T>
where
    E: Send + 'static,
    T: Send + 'static,
{
    /// Start `work` on a named thread
    ///
    /// `work` receives the event sender; `cancel_flag` is the flag it checks
    /// between chunks.
    pub fn spawn<F>(name: &str, cancel_flag: Arc<AtomicBool>, work: F) -> Result<Self>
    where
        F: FnOnce(Sender<E>) -> Result<T> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || work(tx))?;

        Ok(Self {
            events: rx,
            handle,
            cancel_flag,
        })
    }
}

impl<E, T> Task<E, T> {
    /// Progress events; the channel closes when the worker finishes
    pub fn events(&self) -> &Receiver<E> {
        &self.events
    }

    /// Ask the worker to stop at its next chunk boundary
    pub fn cancel(&self) {
        self.cancel_flag.store(true, Ordering::SeqCst);
    }

    /// Handle to the worker's cancel flag
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel_flag)
    }

    /// Whether the worker has returned
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the terminal result
    pub fn join(self) -> Result<T> {
        self.handle
            .join()
            .map_err(|_| Error::Io(std::io::Error::other("worker thread panicked")))?
    }
}
