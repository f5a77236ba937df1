pub mod peer;
pub mod tracker;
pub mod wire;
