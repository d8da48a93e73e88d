pub mod jitter;

pub use jitter::jittered;
