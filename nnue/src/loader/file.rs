use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;

use crate::config::{InputBuckets, NetConfig};
use crate::error::ProducerError;
use crate::wire::{encode_batch, Batch, WireLayout};

use super::RecordProducer;

// Records buffered per worker
const WORKER_CHANNEL_DEPTH: usize = 2;

/// Parameters for opening a record file.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub data_path: PathBuf,
    pub batch_size: usize,
    pub threads: usize,
    /// Bucket map the records were encoded with, if known. Must match the
    /// network's.
    pub buckets: Option<InputBuckets>,
}

/// One reader thread: records come in on `records`, emptied buffers go back
/// on `spare` to be read into again.
struct Reader {
    records: mpsc::Receiver<std::io::Result<Vec<u8>>>,
    spare: mpsc::Sender<Vec<u8>>,
}

/// Streams a file of concatenated records with several reader threads.
///
/// Worker `w` of `T` reads records `w, w + T, w + 2T, ...` and wraps around
/// at the end of the file. Workers are drained round-robin, so the stream
/// yields records `0, 1, 2, ...` in file order, looping forever.
pub struct RecordFile {
    readers: Vec<Reader>,
    workers: Vec<thread::JoinHandle<()>>,
    next: usize,
    records: u64,
}

impl RecordFile {
    pub fn open(
        config: &ProducerConfig,
        net: &NetConfig,
        layout: &WireLayout,
    ) -> Result<Self, ProducerError> {
        if config.threads == 0 {
            return Err(ProducerError::Config("at least one reader thread is required".into()));
        }
        if config.batch_size != net.batch_size {
            return Err(ProducerError::Config(format!(
                "batch size {} does not match the network's {}",
                config.batch_size, net.batch_size
            )));
        }
        if let Some(buckets) = &config.buckets {
            if *buckets != net.buckets {
                return Err(ProducerError::Config(
                    "bucket map does not match the network's".into(),
                ));
            }
        }

        let record = layout.record_size(net);
        let bytes = std::fs::metadata(&config.data_path)?.len();
        if bytes == 0 || bytes % record as u64 != 0 {
            return Err(ProducerError::BadFileLength {
                path: config.data_path.clone(),
                bytes,
                record,
            });
        }
        let records = bytes / record as u64;

        let mut readers = Vec::with_capacity(config.threads);
        let mut workers = Vec::with_capacity(config.threads);
        for first in 0..config.threads as u64 {
            let file = File::open(&config.data_path)?;
            let (tx, rx) = mpsc::sync_channel(WORKER_CHANNEL_DEPTH);
            let (spare_tx, spare_rx) = mpsc::channel();
            let stride = config.threads as u64;

            workers.push(thread::spawn(move || {
                read_strided(file, first, stride, records, record, tx, spare_rx)
            }));
            readers.push(Reader {
                records: rx,
                spare: spare_tx,
            });
        }

        log::info!(
            "Opened {:?}: {} records of {} bytes, {} reader threads",
            config.data_path,
            records,
            record,
            config.threads
        );

        Ok(Self {
            readers,
            workers,
            next: 0,
            records,
        })
    }

    pub fn num_records(&self) -> u64 {
        self.records
    }
}

fn read_strided(
    mut file: File,
    first: u64,
    stride: u64,
    records: u64,
    record: usize,
    tx: mpsc::SyncSender<std::io::Result<Vec<u8>>>,
    spare: mpsc::Receiver<Vec<u8>>,
) {
    let mut index = first % records;
    loop {
        // Only allocates until the first returned buffers come back
        let mut buf = spare.try_recv().unwrap_or_default();
        buf.resize(record, 0);
        let read = file
            .seek(SeekFrom::Start(index * record as u64))
            .and_then(|_| file.read_exact(&mut buf));

        let failed = read.is_err();
        if tx.send(read.map(|_| buf)).is_err() || failed {
            break;
        }
        index = (index + stride) % records;
    }
}

impl RecordProducer for RecordFile {
    fn fill(&mut self, buf: &mut Vec<u8>) -> Result<(), ProducerError> {
        let reader = &self.readers[self.next % self.readers.len()];
        self.next += 1;

        let record = reader
            .records
            .recv()
            .map_err(|_| ProducerError::Disconnected)??;
        let returned = std::mem::replace(buf, record);
        // Fails only once the worker has stopped
        let _ = reader.spare.send(returned);
        Ok(())
    }
}

impl Drop for RecordFile {
    fn drop(&mut self) {
        // Closing the channels unblocks workers waiting to send
        self.readers.clear();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Appends encoded batches to a record file.
pub struct RecordWriter {
    writer: BufWriter<File>,
    layout: WireLayout,
    config: NetConfig,
    buf: Vec<u8>,
    written: usize,
}

impl RecordWriter {
    pub fn create(path: &Path, layout: WireLayout, config: NetConfig) -> Result<Self, ProducerError> {
        let file = File::create(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            layout,
            config,
            buf: Vec::new(),
            written: 0,
        })
    }

    pub fn write(&mut self, batch: &Batch) -> Result<(), ProducerError> {
        if batch.size != self.config.batch_size {
            return Err(ProducerError::Config(format!(
                "batch of {} entries, records hold {}",
                batch.size, self.config.batch_size
            )));
        }
        self.buf.clear();
        encode_batch(batch, &self.layout, &self.config, &mut self.buf);
        self.writer.write_all(&self.buf)?;
        self.written += 1;
        Ok(())
    }

    /// Flushes and returns the number of records written.
    pub fn finish(mut self) -> Result<usize, ProducerError> {
        self.writer.flush()?;
        Ok(self.written)
    }
}
