// Library interface for the RSKT daemon
// The binary, integration tests and benchmarks all go through it

pub mod daemon;
pub mod logging;
