use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

/// A thread handle that can be signaled to stop.
///
/// The counting-thread timer runs on one of these. Dropping the handle
/// without calling [`CancelableJoinHandle::join`] still stops the thread.
pub struct CancelableJoinHandle<T> {
    handle: Option<thread::JoinHandle<T>>,
    running: Arc<AtomicBool>,
}

/// Spawns a cancelable thread that can be joined later.
/// The thread is passed an `Arc<AtomicBool>` that can be used to check if the thread should stop running.
/// The thread is requested to stop running when the `AtomicBool` is set to `false`.
pub fn spawn_cancelable<T: Send + 'static>(
    func: impl FnOnce(Arc<AtomicBool>) -> T + Send + 'static,
) -> CancelableJoinHandle<T> {
    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    let handle = thread::spawn(move || func(r));
    CancelableJoinHandle {
        handle: Some(handle),
        running,
    }
}

impl<T> CancelableJoinHandle<T> {
    /// `true` if thread has not been signaled to stop
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Signals the thread to stop and waits for it to finish.
    ///
    /// # Errors
    ///
    /// Returns error if thread panicked
    pub fn join(mut self) -> thread::Result<Option<T>> {
        self.running.store(false, Ordering::Relaxed);
        match self.handle.take() {
            Some(handle) => handle.join().map(Some),
            None => Ok(None),
        }
    }
}

impl<T> Drop for CancelableJoinHandle<T> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::spawn_cancelable;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_join_stops_loop() {
        let handle = spawn_cancelable(|running| {
            let mut n = 0u64;
            while running.load(Ordering::Relaxed) {
                n = n.wrapping_add(1);
                std::hint::spin_loop();
            }
            n
        });
        assert!(handle.is_running());
        let res = handle.join().expect("thread panicked");
        assert!(res.is_some());
    }
}
