pub mod core;
pub mod generate;
pub mod modules;
pub mod questions;
pub mod reports;
