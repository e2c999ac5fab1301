pub mod backend;
pub mod chunk_sink;
