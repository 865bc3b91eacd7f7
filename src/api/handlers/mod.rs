pub mod resize;
pub mod system;
