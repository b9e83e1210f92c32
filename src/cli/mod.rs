//! Command-line interface

pub mod args;
pub mod runner;

pub use args::{Args, Command};
pub use runner::run;
