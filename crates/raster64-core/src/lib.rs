//! Core traits and types for the raster64 emulator workspace.

mod bus;
mod frame;

pub use bus::Bus;
pub use frame::FrameBuffer;
