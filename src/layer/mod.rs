//! Layer archive generation.
//!
//! [`write_layer`] writes a change-set into any writer synchronously.
//! [`generate_layer`] runs the same thing on a worker thread and hands back a
//! [`LayerReader`], so a layer can be streamed straight into a store without
//! being buffered in full.
pub mod idmap;
pub mod tar;

pub use idmap::{IdMapping, MapOptions};
pub use self::tar::{OPAQUE_WHITEOUT, WHITEOUT_PREFIX, write_layer};

use crate::{cancel::CancelToken, diff::Change, error::Result};
use std::{
    io::{self, Read, Write},
    path::PathBuf,
    sync::mpsc::{Receiver, SyncSender, sync_channel},
    thread::JoinHandle,
};

/// Bytes per chunk handed from the worker to the reader.
const CHUNK_SIZE: usize = 64 * 1024;
/// Chunks the worker may run ahead of the reader.
const CHANNEL_DEPTH: usize = 4;

type Chunk = io::Result<Vec<u8>>;

/// Starts writing the layer for `changes` on a worker thread.
///
/// Errors from the worker, including cancellation, surface as read errors.
/// Dropping the reader early stops the worker.
pub fn generate_layer(
    ctx: &CancelToken,
    rootfs: PathBuf,
    changes: Vec<Change>,
    options: MapOptions,
) -> Result<LayerReader> {
    let (sender, receiver) = sync_channel::<Chunk>(CHANNEL_DEPTH);
    let ctx = ctx.clone();

    let worker = std::thread::Builder::new()
        .name("layer-writer".to_owned())
        .spawn(move || {
            let writer = ChannelWriter {
                sender: sender.clone(),
                buf: Vec::with_capacity(CHUNK_SIZE),
            };
            let result = write_layer(&ctx, &rootfs, &changes, &options, writer)
                .and_then(|writer| Ok(writer.finish()?));
            if let Err(e) = result {
                tracing::debug!("Layer writer stopped: {e}");
                // The reader may already be gone, in which case nobody cares.
                if sender.send(Err(io::Error::other(e))).is_err() {
                    tracing::trace!("Layer reader dropped before the error was delivered");
                }
            }
        })?;

    Ok(LayerReader {
        receiver: Some(receiver),
        chunk: Vec::new(),
        pos: 0,
        worker: Some(worker),
    })
}

/// Writer side of the channel, batching small writes into chunks.
struct ChannelWriter {
    sender: SyncSender<Chunk>,
    buf: Vec<u8>,
}

impl ChannelWriter {
    fn send_buffered(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::replace(&mut self.buf, Vec::with_capacity(CHUNK_SIZE));
        self.sender
            .send(Ok(chunk))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "layer reader was dropped"))
    }

    fn finish(mut self) -> io::Result<()> {
        self.send_buffered()
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let room = CHUNK_SIZE - self.buf.len();
        let n = data.len().min(room);
        self.buf.extend_from_slice(&data[..n]);
        if self.buf.len() >= CHUNK_SIZE {
            self.send_buffered()?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_buffered()
    }
}

/// The read end of a layer being generated in the background.
pub struct LayerReader {
    receiver: Option<Receiver<Chunk>>,
    chunk: Vec<u8>,
    pos: usize,
    worker: Option<JoinHandle<()>>,
}

impl LayerReader {
    fn join_worker(&mut self) -> io::Result<()> {
        match self.worker.take().map(JoinHandle::join) {
            Some(Err(_)) => Err(io::Error::other("layer writer thread panicked")),
            _ => Ok(()),
        }
    }
}

impl Read for LayerReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.pos < self.chunk.len() {
                let n = buf.len().min(self.chunk.len() - self.pos);
                buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            let Some(receiver) = self.receiver.as_ref() else {
                return Ok(0);
            };
            match receiver.recv() {
                Ok(Ok(chunk)) => {
                    self.chunk = chunk;
                    self.pos = 0;
                }
                Ok(Err(e)) => {
                    self.receiver = None;
                    self.join_worker()?;
                    return Err(e);
                }
                Err(_) => {
                    // Worker hung up: either done, or it panicked.
                    self.receiver = None;
                    self.join_worker()?;
                    return Ok(0);
                }
            }
        }
    }
}

impl Drop for LayerReader {
    fn drop(&mut self) {
        // Unblocks a worker stuck on a full channel.
        self.receiver = None;
        if let Err(e) = self.join_worker() {
            tracing::warn!("{e}");
        }
    }
}
