pub mod daemon;
pub mod sync;
