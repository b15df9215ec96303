#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod batch;
pub mod bootstrap;
pub mod config;
pub mod correlate;
pub mod data;
pub mod diagnostics;
pub mod io;
pub mod pool;
pub mod regress;
pub mod types;
