pub mod handle;
pub mod input_stream;
pub mod registry;
