pub mod invocation;
pub mod snapshot;
