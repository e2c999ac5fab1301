pub mod buffer_pool;
pub mod gain;
