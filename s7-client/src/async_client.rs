//! Asynchronous client operations.
//!
//! An [`AsyncClient`] owns a [`Client`] and runs one data transfer at a time on a
//! background [`Job`]. The caller polls with [`AsyncClient::check_as_completion`], blocks
//! with [`AsyncClient::wait_as_completion`], or registers a callback. Reads complete with
//! the bytes read, writes with an empty buffer.
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use s7_protocol::{
    error::{ErrorCode, S7Error},
    types::{Area, WordLen},
};

use crate::{
    client::Client,
    job::{Completion, Job, destroying},
};

pub struct AsyncClient {
    client: Arc<Mutex<Client>>,
    job: Mutex<Option<Job<Vec<u8>>>>,
    callback: Mutex<Option<Completion<Vec<u8>>>>,
}

impl std::fmt::Debug for AsyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncClient")
            .field("pending", &self.is_pending())
            .finish()
    }
}

impl AsyncClient {
    pub fn new(client: Client) -> AsyncClient {
        AsyncClient {
            client: Arc::new(Mutex::new(client)),
            job: Mutex::new(None),
            callback: Mutex::new(None),
        }
    }

    /// Runs `f` on the client. Blocks while a background job holds it.
    pub fn with_client<R>(&self, f: impl FnOnce(&mut Client) -> R) -> Result<R, S7Error> {
        let mut client = self.client.lock().map_err(destroying)?;
        Ok(f(&mut client))
    }

    /// Registers the callback run on the worker when a job completes.
    pub fn set_as_callback(&self, callback: Option<Completion<Vec<u8>>>) {
        if let Ok(mut slot) = self.callback.lock() {
            *slot = callback;
        }
    }

    fn is_pending(&self) -> bool {
        self.job
            .lock()
            .map(|slot| slot.as_ref().is_some_and(|job| !job.is_finished()))
            .unwrap_or(false)
    }

    fn launch<F>(&self, work: F) -> Result<(), S7Error>
    where
        F: FnOnce(&mut Client) -> Result<Vec<u8>, S7Error> + Send + 'static,
    {
        let mut slot = self.job.lock().map_err(destroying)?;
        if slot.as_ref().is_some_and(|job| !job.is_finished()) {
            return Err(S7Error::Client(ErrorCode::JOB_PENDING));
        }
        let callback = self.callback.lock().map_err(destroying)?.clone();
        let client = Arc::clone(&self.client);
        *slot = Some(Job::spawn(
            move || {
                let mut client = client.lock().map_err(destroying)?;
                work(&mut client)
            },
            callback,
        ));
        Ok(())
    }

    pub fn as_read_area(
        &self,
        area: Area,
        db_number: u16,
        start: u32,
        amount: u16,
        word_len: WordLen,
    ) -> Result<(), S7Error> {
        self.launch(move |client| client.read_area(area, db_number, start, amount, word_len))
    }

    pub fn as_write_area(
        &self,
        area: Area,
        db_number: u16,
        start: u32,
        amount: u16,
        word_len: WordLen,
        data: Vec<u8>,
    ) -> Result<(), S7Error> {
        self.launch(move |client| {
            client
                .write_area(area, db_number, start, amount, word_len, &data)
                .map(|_| Vec::new())
        })
    }

    pub fn as_db_read(&self, db_number: u16, start: u32, size: usize) -> Result<(), S7Error> {
        self.launch(move |client| client.db_read(db_number, start, size))
    }

    pub fn as_db_write(&self, db_number: u16, start: u32, data: Vec<u8>) -> Result<(), S7Error> {
        self.launch(move |client| client.db_write(db_number, start, &data).map(|_| Vec::new()))
    }

    /// `None` while the job is running.
    pub fn check_as_completion(&self) -> Option<Result<Vec<u8>, S7Error>> {
        match self.job.lock() {
            Ok(slot) => match slot.as_ref() {
                Some(job) => job.poll(),
                None => Some(Err(S7Error::Client(ErrorCode::FUNCTION_REFUSED))),
            },
            Err(_) => Some(Err(S7Error::Client(ErrorCode::DESTROYING))),
        }
    }

    pub fn wait_as_completion(&self, timeout: Duration) -> Result<Vec<u8>, S7Error> {
        // the slot lock is released before blocking
        let job = self.job.lock().map_err(destroying)?.clone();
        match job {
            Some(job) => job.wait(timeout),
            None => Err(S7Error::Client(ErrorCode::FUNCTION_REFUSED)),
        }
    }
}
