//! Reserving address space and committing it on demand.

mod heap;
mod os;

use std::{io, ptr::NonNull};
use thiserror::Error;

use crate::config::MemoryBackend;

pub use heap::HeapReservation;
pub use os::OsReservation;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("couldn't reserve {size} bytes of address space: {source}")]
    Reserve {
        size: usize,
        #[source]
        source: io::Error,
    },
    #[error("couldn't commit {len} bytes at offset {offset}: {source}")]
    Commit {
        offset: usize,
        len: usize,
        #[source]
        source: io::Error,
    },
    #[error("couldn't decommit {len} bytes at offset {offset}: {source}")]
    Decommit {
        offset: usize,
        len: usize,
        #[source]
        source: io::Error,
    },
    #[error("reserving address space is not supported on this platform")]
    Unsupported,
}

/// A contiguous range of reserved address space.
///
/// Only committed ranges may be read or written. Offsets and lengths
/// passed to `commit` and `decommit` are in bytes from `base()` and are
/// multiples of the stack's commit granularity. Dropping a reservation
/// releases the whole range.
pub trait PageReservation: Send {
    fn base(&self) -> NonNull<u8>;
    fn size(&self) -> usize;
    fn commit(&mut self, offset: usize, len: usize) -> Result<(), MemoryError>;
    /// Gives the backing memory of a range back. The range reads as
    /// zeroes if it is committed again.
    fn decommit(&mut self, offset: usize, len: usize) -> Result<(), MemoryError>;
}

pub fn reserve(
    backend: MemoryBackend,
    size: usize,
) -> Result<Box<dyn PageReservation>, MemoryError> {
    Ok(match backend {
        MemoryBackend::Os => Box::new(OsReservation::reserve(size)?),
        MemoryBackend::Heap => Box::new(HeapReservation::reserve(size)),
    })
}

/// Size of an OS page in bytes.
pub fn page_size() -> usize {
    os::page_size()
}
