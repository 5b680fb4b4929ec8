pub mod batcher;
pub mod batchitem;
pub mod item;
pub mod loader;
pub mod transform;
pub mod window;
