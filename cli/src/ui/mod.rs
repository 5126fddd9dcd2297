//! Terminal output for the CLI.

pub mod config;
pub mod render;

pub use config::{EnvState, UiConfig};
pub use render::Ui;
