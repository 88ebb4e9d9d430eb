#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
pub mod bits;
pub mod config;
pub mod engine;
pub mod index;
pub mod io;
pub mod pipeline;
pub mod progress;
pub mod store;
pub mod tokens;
pub mod types;

#[path = "../cluster/mod.rs"]
pub mod cluster;
