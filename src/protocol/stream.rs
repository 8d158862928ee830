//! Streamed transfers.
//!
//! Some device functions move more data than one packet can carry. Device
//! modules expose them as a low-level function that carries one fixed-size
//! chunk plus the total message length and the chunk's offset. The helpers
//! here split a payload into such chunks or reassemble a message from them.
//!
//! Transfers of the same function on one handle are serialized. A read whose
//! chunks do not line up (wrong offset, or the total length changing midway)
//! drains the rest of the device's current stream and fails with
//! `StreamOutOfSync`, so the next read starts at offset zero again.

use crate::error::{constants, ProtocolError, Result};
use crate::protocol::device::DeviceHandle;
use std::future::Future;
use tracing::{debug, warn};

/// One chunk handed to a low-level write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteChunk<T> {
    pub message_length: usize,
    pub chunk_offset: usize,
    /// Always `chunk_length` elements. The last chunk is padded with
    /// `T::default()`.
    pub data: Vec<T>,
}

/// Answer to one low-level write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkWritten<O> {
    /// Elements of this chunk the device accepted
    pub written: usize,
    pub output: O,
}

/// One chunk returned by a low-level read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadChunk<T, O> {
    pub message_length: usize,
    pub chunk_offset: usize,
    pub data: Vec<T>,
    pub output: O,
}

impl DeviceHandle {
    /// Send `payload` in chunks of `chunk_length` through `write_chunk`.
    ///
    /// Stops early once the device accepts less than a full chunk. Returns
    /// the total accepted and the output of the last low-level write. An
    /// empty payload still issues one (padded) write.
    pub async fn write_stream<T, O, F, Fut>(
        &self,
        function_id: u8,
        payload: &[T],
        max_length: usize,
        chunk_length: usize,
        mut write_chunk: F,
    ) -> Result<(usize, O)>
    where
        T: Copy + Default,
        F: FnMut(WriteChunk<T>) -> Fut,
        Fut: Future<Output = Result<ChunkWritten<O>>>,
    {
        self.check_active()?;
        if chunk_length == 0 {
            return Err(ProtocolError::InvalidArgument(
                "chunk length must be greater than 0".to_string(),
            ));
        }
        if payload.len() > max_length {
            return Err(ProtocolError::InvalidArgument(format!(
                "{} ({} > {max_length})",
                constants::ERR_STREAM_TOO_LONG,
                payload.len()
            )));
        }

        let lock = self.stream_lock(function_id);
        let _guard = lock.lock().await;

        let message_length = payload.len();
        let mut chunk_offset = 0;
        let mut written_sum = 0;
        loop {
            let end = (chunk_offset + chunk_length).min(message_length);
            let mut data = payload[chunk_offset..end].to_vec();
            data.resize(chunk_length, T::default());

            let answer = write_chunk(WriteChunk {
                message_length,
                chunk_offset,
                data,
            })
            .await?;

            written_sum += answer.written;
            chunk_offset += chunk_length;
            if answer.written < chunk_length || chunk_offset >= message_length {
                debug!(peer_id = self.peer_id(), function_id, written = written_sum, "Stream written");
                return Ok((written_sum, answer.output));
            }
        }
    }

    /// Reassemble one message from consecutive `read_chunk` results.
    ///
    /// Returns the message and the output of the last low-level read.
    pub async fn read_stream<T, O, F, Fut>(
        &self,
        function_id: u8,
        mut read_chunk: F,
    ) -> Result<(Vec<T>, O)>
    where
        T: Copy,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<ReadChunk<T, O>>>,
    {
        self.check_active()?;
        let lock = self.stream_lock(function_id);
        let _guard = lock.lock().await;

        let mut chunk = read_chunk().await?;
        let message_length = chunk.message_length;
        let mut message = Vec::with_capacity(message_length);
        let mut in_sync = chunk.chunk_offset == 0;

        while in_sync {
            let take = chunk.data.len().min(message_length - message.len());
            message.extend_from_slice(&chunk.data[..take]);
            if message.len() >= message_length {
                return Ok((message, chunk.output));
            }
            if take == 0 {
                in_sync = false;
                break;
            }

            chunk = read_chunk().await?;
            in_sync = chunk.chunk_offset == message.len() && chunk.message_length == message_length;
        }

        warn!(
            peer_id = self.peer_id(),
            function_id,
            expected_offset = message.len(),
            chunk_offset = chunk.chunk_offset,
            "Stream out of sync"
        );

        // Bounded by the chunk count of the stream the device is sending.
        let mut remaining = chunk.message_length.div_ceil(chunk.data.len().max(1));
        while remaining > 0
            && !chunk.data.is_empty()
            && chunk.chunk_offset + chunk.data.len() < chunk.message_length
        {
            chunk = read_chunk().await?;
            remaining -= 1;
        }

        Err(ProtocolError::StreamOutOfSync { function_id })
    }
}
