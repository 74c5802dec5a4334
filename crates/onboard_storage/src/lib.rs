#![forbid(unsafe_code)]

pub mod ph1f;
pub mod ph1j;
pub mod repo;
