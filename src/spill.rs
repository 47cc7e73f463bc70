//! Spilled chunks.
//!
//! A chunk outside of the residency window can be parked in a temporary file. The
//! file starts with a 4-byte big-endian header length followed by the MessagePack
//! encoded [`ChunkDescriptor`]. The sections follow, each one starting at an
//! 8-byte aligned offset computed from the descriptor:
//!
//! ```text
//! | len | descriptor | pad | column store | pad | index | pad | status | pad | side buffer |
//! ```

use std::fs;
use std::io::{self, prelude::*, SeekFrom};

use serde::{Deserialize, Serialize};

use crate::buffer::SideBuffer;
use crate::chunk::{ChunkId, ColumnChunk, ColumnStore};
use crate::sort::SortError;
use crate::status::Status;

/// Section alignment.
const SECTION_ALIGN: u64 = 8;

fn align(len: u64) -> u64 {
    (len + SECTION_ALIGN - 1) & !(SECTION_ALIGN - 1)
}

/// Spill file header: chunk metadata and section lengths.
/// Section offsets are relative to the body, the first aligned byte after the header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub chunk_id: ChunkId,
    pub rows: usize,
    pub capacity: usize,
    pub side_limit: usize,
    pub store_len: u64,
    pub index_len: u64,
    pub status_len: u64,
    pub side_len: u64,
}

impl ChunkDescriptor {
    pub fn store_offset(&self) -> u64 {
        0
    }

    pub fn index_offset(&self) -> u64 {
        self.store_offset() + align(self.store_len)
    }

    pub fn status_offset(&self) -> u64 {
        self.index_offset() + align(self.index_len)
    }

    pub fn side_offset(&self) -> u64 {
        self.status_offset() + align(self.status_len)
    }

    pub fn body_len(&self) -> u64 {
        self.side_offset() + self.side_len
    }
}

/// Column chunk stored in a temporary file.
#[derive(Debug)]
pub struct SpilledChunk {
    file: fs::File,
    descriptor: ChunkDescriptor,
    rw_buf_size: Option<usize>,
}

impl SpilledChunk {
    /// Writes the chunk into a new temporary file in `dir`.
    pub fn spill(
        dir: &tempfile::TempDir,
        chunk: ColumnChunk,
        rw_buf_size: Option<usize>,
    ) -> Result<Self, SortError> {
        let (chunk_id, store, side, index, rows, capacity, status) = chunk.into_parts();

        let store = rmp_serde::to_vec(&store).map_err(SortError::SerializationError)?;
        let index = rmp_serde::to_vec(&index).map_err(SortError::SerializationError)?;
        let status = rmp_serde::to_vec(&status).map_err(SortError::SerializationError)?;

        let descriptor = ChunkDescriptor {
            chunk_id,
            rows,
            capacity,
            side_limit: side.limit(),
            store_len: store.len() as u64,
            index_len: index.len() as u64,
            status_len: status.len() as u64,
            side_len: side.len() as u64,
        };
        let header = rmp_serde::to_vec(&descriptor).map_err(SortError::SerializationError)?;

        let tmp_file = tempfile::tempfile_in(dir).map_err(SortError::TempDir)?;
        let mut writer = match rw_buf_size {
            Some(buf_size) => io::BufWriter::with_capacity(buf_size, tmp_file.try_clone().map_err(SortError::IO)?),
            None => io::BufWriter::new(tmp_file.try_clone().map_err(SortError::IO)?),
        };

        let header_len = 4 + header.len() as u64;
        let sections = [
            (&store[..], align(descriptor.store_len)),
            (&index[..], align(descriptor.index_len)),
            (&status[..], align(descriptor.status_len)),
            (side.as_bytes(), descriptor.side_len),
        ];
        write_file(&mut writer, &header, align(header_len) - 4, &sections).map_err(SortError::IO)?;

        log::debug!(
            "spilled {} ({} rows, {} bytes)",
            chunk_id,
            rows,
            align(header_len) + descriptor.body_len()
        );

        return Ok(SpilledChunk {
            file: tmp_file,
            descriptor,
            rw_buf_size,
        });
    }

    pub fn descriptor(&self) -> &ChunkDescriptor {
        &self.descriptor
    }

    pub fn rows(&self) -> usize {
        self.descriptor.rows
    }

    /// Reads the chunk back. The file is left untouched, so a chunk can be restored repeatedly.
    pub fn restore(&self) -> Result<ColumnChunk, SortError> {
        let file = self.file.try_clone().map_err(SortError::IO)?;
        let mut reader = match self.rw_buf_size {
            Some(buf_size) => io::BufReader::with_capacity(buf_size, file),
            None => io::BufReader::new(file),
        };

        let len = read_section(&mut reader, 0, 4)?;
        let header_len = u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as u64;
        let header = read_section(&mut reader, 4, header_len)?;
        let descriptor: ChunkDescriptor =
            rmp_serde::from_slice(&header).map_err(SortError::DeserializationError)?;

        let body = align(4 + header_len);
        let store = read_section(&mut reader, body + descriptor.store_offset(), descriptor.store_len)?;
        let index = read_section(&mut reader, body + descriptor.index_offset(), descriptor.index_len)?;
        let status = read_section(&mut reader, body + descriptor.status_offset(), descriptor.status_len)?;
        let side = read_section(&mut reader, body + descriptor.side_offset(), descriptor.side_len)?;

        let store: ColumnStore = rmp_serde::from_slice(&store).map_err(SortError::DeserializationError)?;
        let index: Vec<u32> = rmp_serde::from_slice(&index).map_err(SortError::DeserializationError)?;
        let status: Status = rmp_serde::from_slice(&status).map_err(SortError::DeserializationError)?;

        return Ok(ColumnChunk::from_parts(
            descriptor.chunk_id,
            store,
            SideBuffer::from_parts(descriptor.side_limit, side),
            index,
            descriptor.rows,
            descriptor.capacity,
            status,
        ));
    }
}

fn write_file(
    writer: &mut io::BufWriter<fs::File>,
    header: &[u8],
    header_padded_len: u64,
    sections: &[(&[u8], u64)],
) -> io::Result<()> {
    writer.write_all(&(header.len() as u32).to_be_bytes())?;
    write_padded(writer, header, header_padded_len)?;
    for (bytes, padded_len) in sections {
        write_padded(writer, bytes, *padded_len)?;
    }
    writer.flush()
}

fn write_padded(writer: &mut impl Write, bytes: &[u8], padded_len: u64) -> io::Result<()> {
    writer.write_all(bytes)?;
    let padding = padded_len as usize - bytes.len();
    writer.write_all(&[0u8; SECTION_ALIGN as usize][..padding])
}

fn read_section(reader: &mut io::BufReader<fs::File>, offset: u64, len: u64) -> Result<Vec<u8>, SortError> {
    let mut bytes = Vec::with_capacity(len as usize);
    reader.seek(SeekFrom::Start(offset)).map_err(SortError::IO)?;
    reader.by_ref().take(len).read_to_end(&mut bytes).map_err(SortError::IO)?;

    if bytes.len() as u64 != len {
        return Err(SortError::IO(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("spill section at {} truncated ({} of {} bytes)", offset, bytes.len(), len),
        )));
    }

    return Ok(bytes);
}
