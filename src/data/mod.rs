//! Frame buffering and pyramid storage.

pub mod codec;
#[cfg(feature = "storage_hdf5")]
pub mod hdf5_pyramid;
pub mod memory;
pub mod pyramid;
pub mod ring_buffer;
