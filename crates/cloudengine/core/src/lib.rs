pub mod env;
pub mod retry;
pub mod signal;
pub mod tracer;
