// vm_traps/src/trap/collections/mod.rs

//! # Collections Module
//!
//! Fixed-capacity data structures that never allocate, so they can be
//! updated from inside a signal handler.

pub mod ring_buffer;

pub use self::ring_buffer::RingBuffer;
