//! Background jobs with a completion callback and a bounded wait.
use std::{
    sync::{Arc, Condvar, Mutex},
    thread,
    time::Duration,
};

use s7_protocol::error::{ErrorCode, S7Error};

/// Invoked on the worker thread after the result is stored.
pub type Completion<T> = Arc<dyn Fn(&Result<T, S7Error>) + Send + Sync>;

/// Maps a poisoned lock to the error reported while an object is torn down.
pub(crate) fn destroying<T>(_: T) -> S7Error {
    S7Error::Client(ErrorCode::DESTROYING)
}

type Slot<T> = Arc<(Mutex<Option<Result<T, S7Error>>>, Condvar)>;

/// Handle to work running on its own thread.
pub struct Job<T> {
    slot: Slot<T>,
}

impl<T> Clone for Job<T> {
    fn clone(&self) -> Self {
        Job {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T: Clone + Send + 'static> std::fmt::Debug for Job<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl<T: Clone + Send + 'static> Job<T> {
    pub fn spawn<F>(work: F, callback: Option<Completion<T>>) -> Job<T>
    where
        F: FnOnce() -> Result<T, S7Error> + Send + 'static,
    {
        let slot: Slot<T> = Arc::new((Mutex::new(None), Condvar::new()));
        let worker = Arc::clone(&slot);
        thread::spawn(move || {
            let result = work();
            let (lock, done) = &*worker;
            match lock.lock() {
                Ok(mut guard) => *guard = Some(result.clone()),
                Err(poisoned) => *poisoned.into_inner() = Some(result.clone()),
            }
            done.notify_all();
            if let Some(callback) = &callback {
                callback(&result);
            }
        });
        Job { slot }
    }

    pub fn is_finished(&self) -> bool {
        self.slot
            .0
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(true)
    }

    /// The result if the job has completed, without blocking.
    pub fn poll(&self) -> Option<Result<T, S7Error>> {
        match self.slot.0.lock() {
            Ok(guard) => (*guard).clone(),
            Err(_) => Some(Err(S7Error::Client(ErrorCode::DESTROYING))),
        }
    }

    /// Blocks until the job completes or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> Result<T, S7Error> {
        let (lock, done) = &*self.slot;
        let guard = lock
            .lock()
            .map_err(|_| S7Error::Client(ErrorCode::DESTROYING))?;
        let (guard, _) = done
            .wait_timeout_while(guard, timeout, |result| result.is_none())
            .map_err(|_| S7Error::Client(ErrorCode::DESTROYING))?;
        match guard.as_ref() {
            Some(result) => result.clone(),
            None => Err(S7Error::Timeout(ErrorCode::JOB_TIMEOUT)),
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::mpsc;

    use super::*;

    #[test]
    fn completes_and_calls_back() {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let job = Job::spawn(
            || Ok(42u32),
            Some(Arc::new(move |result: &Result<u32, S7Error>| {
                tx.lock().unwrap().send(result.clone()).unwrap();
            })),
        );
        assert_eq!(job.wait(Duration::from_secs(5)), Ok(42));
        assert!(job.is_finished());
        assert_eq!(job.poll(), Some(Ok(42)));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Ok(42));
    }

    #[test]
    fn wait_times_out() {
        let job = Job::spawn(
            || {
                thread::sleep(Duration::from_millis(300));
                Ok(())
            },
            None,
        );
        assert_eq!(job.poll(), None);
        assert_eq!(
            job.wait(Duration::from_millis(10)),
            Err(S7Error::Timeout(ErrorCode::JOB_TIMEOUT))
        );
        assert_eq!(job.wait(Duration::from_secs(5)), Ok(()));
    }
}
