#![forbid(unsafe_code)]

pub mod ph1psync;
