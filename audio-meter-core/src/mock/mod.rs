//! In-memory backend for tests and demos without audio hardware.

pub mod mock_backend;

pub use mock_backend::MockBackend;
