pub mod backoff;
pub mod exec;
pub mod networking;
pub mod process;
