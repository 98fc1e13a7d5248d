pub mod runs;
pub mod triggers;
