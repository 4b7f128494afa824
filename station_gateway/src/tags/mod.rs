pub mod engine;
pub mod structures;
