//! In-memory engine, mostly for tests and dry runs.
use super::{Engine, StoreConfig, copy_chunked};
use crate::{
    cancel::CancelToken,
    digest::{Digest, DigestAlgorithm, DigestReader, VerifiedReader},
    error::{Error, Result},
    image::Index,
};
use std::{
    collections::HashMap,
    io::{self, Cursor, Read},
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

#[derive(Default)]
struct MemoryState {
    blobs: HashMap<Digest, Arc<[u8]>>,
    index: Option<Index>,
    closed: bool,
}

#[derive(Default)]
pub struct MemoryEngine {
    config: StoreConfig,
    state: RwLock<MemoryState>,
}

impl MemoryEngine {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            state: RwLock::default(),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryState>> {
        let state = self
            .state
            .read()
            .map_err(|_| io::Error::other("memory engine lock poisoned"))?;
        if state.closed {
            return Err(Error::Closed);
        }
        Ok(state)
    }

    fn ensure_open(&self) -> Result<()> {
        self.read().map(drop)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryState>> {
        let state = self
            .state
            .write()
            .map_err(|_| io::Error::other("memory engine lock poisoned"))?;
        if state.closed {
            return Err(Error::Closed);
        }
        Ok(state)
    }
}

impl Engine for MemoryEngine {
    fn algorithm(&self) -> DigestAlgorithm {
        self.config.digest_algorithm
    }

    fn put_blob(&self, ctx: &CancelToken, reader: &mut dyn Read) -> Result<(Digest, u64)> {
        ctx.check()?;
        self.ensure_open()?;

        let mut data = Vec::new();
        let mut hashing = DigestReader::new(reader, self.algorithm());
        copy_chunked(ctx, &mut hashing, &mut data)?;
        let (digest, size) = hashing.finish();

        self.write()?
            .blobs
            .entry(digest.clone())
            .or_insert_with(|| Arc::from(data));
        Ok((digest, size))
    }

    fn put_index(&self, ctx: &CancelToken, index: &Index) -> Result<()> {
        ctx.check()?;
        self.write()?.index = Some(index.clone());
        Ok(())
    }

    fn get_blob(&self, ctx: &CancelToken, digest: &Digest) -> Result<Box<dyn Read + Send>> {
        ctx.check()?;
        let data = self
            .read()?
            .blobs
            .get(digest)
            .cloned()
            .ok_or_else(|| Error::NotFound(digest.to_string()))?;
        Ok(Box::new(VerifiedReader::new(Cursor::new(data), digest.clone())))
    }

    fn get_index(&self, ctx: &CancelToken) -> Result<Index> {
        ctx.check()?;
        Ok(self.read()?.index.clone().unwrap_or_default())
    }

    fn delete_blob(&self, ctx: &CancelToken, digest: &Digest) -> Result<()> {
        ctx.check()?;
        self.write()?.blobs.remove(digest);
        Ok(())
    }

    fn list_blobs(&self, ctx: &CancelToken) -> Result<Vec<Digest>> {
        ctx.check()?;
        let mut digests: Vec<Digest> = self.read()?.blobs.keys().cloned().collect();
        digests.sort();
        Ok(digests)
    }

    fn clean(&self, ctx: &CancelToken) -> Result<()> {
        ctx.check()?;
        self.ensure_open()
    }

    fn close(&mut self) -> Result<()> {
        let mut state = self.write()?;
        state.closed = true;
        state.blobs.clear();
        Ok(())
    }
}
