/// Asynchronous reader over target memory
///
/// `RemoteStream` presents the memory at a base address as a seekable byte
/// stream, fetching fixed-size blocks on demand and caching them so header
/// walks do not turn every field access into a round trip.

use std::collections::HashMap;
use std::io::SeekFrom;

use crate::commands::{MemoryAccess, Result};

pub const DEFAULT_BLOCK_SIZE: usize = 0x200;

pub struct RemoteStream<'a, M: MemoryAccess> {
    memory: &'a M,
    base: u64,
    position: u64,
    block_size: usize,
    cache: HashMap<u64, Vec<u8>>,
}

impl<'a, M: MemoryAccess> RemoteStream<'a, M> {
    pub fn new(memory: &'a M, base: u64) -> Self {
        Self::with_block_size(memory, base, DEFAULT_BLOCK_SIZE)
    }

    pub fn with_block_size(memory: &'a M, base: u64, block_size: usize) -> Self {
        Self {
            memory,
            base,
            position: 0,
            block_size: block_size.max(1),
            cache: HashMap::new(),
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    /// Offset from the base address
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Move the cursor; `End` is not meaningful for remote memory and is
    /// treated as relative to the current position
    pub fn seek(&mut self, pos: SeekFrom) -> u64 {
        self.position = match pos {
            SeekFrom::Start(offset) => offset,
            SeekFrom::Current(delta) | SeekFrom::End(delta) => {
                self.position.wrapping_add_signed(delta)
            }
        };
        self.position
    }

    /// Fill `buf` from the cursor and advance it
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let data = self.read_at(self.position, buf.len()).await?;
        buf.copy_from_slice(&data);
        self.position += data.len() as u64;
        Ok(data.len())
    }

    /// Read `len` bytes at `offset` from the base without moving the cursor
    pub async fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        let block = self.block_size as u64;

        while out.len() < len {
            let address = self.base.wrapping_add(offset).wrapping_add(out.len() as u64);
            let block_start = address - address % block;
            let within = (address - block_start) as usize;

            if !self.cache.contains_key(&block_start) {
                let data = self.memory.read_memory(block_start, self.block_size).await?;
                self.cache.insert(block_start, data);
            }
            let data = &self.cache[&block_start];

            let take = (len - out.len()).min(data.len().saturating_sub(within));
            if take == 0 {
                break;
            }
            out.extend_from_slice(&data[within..within + take]);
        }

        if out.len() < len {
            return Err(crate::commands::CommandError::Remote(format!(
                "short read at {:#x}: {} of {} bytes",
                self.base.wrapping_add(offset),
                out.len(),
                len
            )));
        }
        Ok(out)
    }

    pub async fn read_u16(&mut self, offset: u64) -> Result<u16> {
        let b = self.read_at(offset, 2).await?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub async fn read_u32(&mut self, offset: u64) -> Result<u32> {
        let b = self.read_at(offset, 4).await?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}
