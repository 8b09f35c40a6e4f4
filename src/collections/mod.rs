//! Small self-contained data structures used across the kernel

pub mod btree;
pub mod ring_buffer;

pub use btree::BTree;
pub use ring_buffer::RingBuffer;
