pub mod level_meter;
pub mod multiband_filter;
pub mod ring_buffer;
pub mod tracker;
