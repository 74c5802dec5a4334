#![forbid(unsafe_code)]

pub mod psync_cli;
