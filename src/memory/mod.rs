pub mod allocator;
pub mod buddy;
pub mod cache;
