//! Producer/consumer pipeline that feeds batches to training.
//!
//! A [`RecordProducer`] runs on its own thread behind a [`BatchStream`]. The
//! consumer asks for one record at a time and hands the previous buffer back
//! with the request, and the producer fills the next record while the
//! consumer trains on the current one. Producers reuse returned buffers
//! rather than allocating one per record.

mod file;

pub use file::{ProducerConfig, RecordFile, RecordWriter};

use std::sync::mpsc;
use std::thread;

use crate::config::NetConfig;
use crate::error::{NnueError, ProducerError};
use crate::wire::{decode_into, Batch, WireLayout};

/// Source of raw batch records.
pub trait RecordProducer: Send + 'static {
    /// Overwrites `buf` with the next record. `buf` is the buffer the
    /// consumer returned and may be kept for reuse.
    fn fill(&mut self, buf: &mut Vec<u8>) -> Result<(), ProducerError>;
}

enum Request {
    Next(Vec<u8>),
    Shutdown,
}

type Response = Result<Vec<u8>, ProducerError>;

pub struct BatchStream {
    requests: mpsc::SyncSender<Request>,
    responses: mpsc::Receiver<Response>,
    worker: Option<thread::JoinHandle<()>>,
}

impl BatchStream {
    pub fn spawn<P: RecordProducer>(mut producer: P) -> Self {
        let (requests, request_rx) = mpsc::sync_channel::<Request>(1);
        let (response_tx, responses) = mpsc::sync_channel::<Response>(1);

        let worker = thread::spawn(move || {
            log::debug!("Producer thread started");

            let produce = |producer: &mut P, mut buf: Vec<u8>| -> Response {
                producer.fill(&mut buf)?;
                Ok(buf)
            };

            // Prefetch so the first request does not wait on a cold producer
            let mut pending = produce(&mut producer, Vec::new());

            while let Ok(Request::Next(returned)) = request_rx.recv() {
                let failed = pending.is_err();
                if response_tx.send(pending).is_err() || failed {
                    break;
                }
                pending = produce(&mut producer, returned);
            }

            log::debug!("Producer thread stopped");
        });

        Self {
            requests,
            responses,
            worker: Some(worker),
        }
    }

    /// Returns `returned` to the producer and blocks until the next record is
    /// ready. After an error the stream is finished.
    pub fn next_record(&mut self, returned: Vec<u8>) -> Result<Vec<u8>, ProducerError> {
        self.requests
            .send(Request::Next(returned))
            .map_err(|_| ProducerError::Disconnected)?;
        self.responses.recv().map_err(|_| ProducerError::Disconnected)?
    }

    /// Stops the producer and waits for its thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            // Fails if the producer already exited after an error
            let _ = self.requests.send(Request::Shutdown);
            let _ = worker.join();
        }
    }
}

impl Drop for BatchStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Decodes every record of a [`BatchStream`] into one reused [`Batch`].
pub struct BatchReader {
    stream: BatchStream,
    layout: WireLayout,
    config: NetConfig,
    buffer: Vec<u8>,
    batch: Batch,
}

impl BatchReader {
    pub fn new(stream: BatchStream, layout: WireLayout, config: NetConfig) -> Self {
        let batch = Batch::new(&config, layout.target);
        Self {
            stream,
            layout,
            config,
            buffer: Vec::new(),
            batch,
        }
    }

    /// The next validated batch. A malformed record is an error, never skipped.
    pub fn next_batch(&mut self) -> Result<&Batch, NnueError> {
        let returned = std::mem::take(&mut self.buffer);
        self.buffer = self.stream.next_record(returned)?;
        decode_into(&self.buffer, &self.layout, &self.config, &mut self.batch)?;
        Ok(&self.batch)
    }

    pub fn shutdown(self) {
        self.stream.shutdown();
    }
}
