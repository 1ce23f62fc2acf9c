pub mod command;
pub mod config;
pub mod events;
pub mod gate;
pub mod goals;
pub mod interpret;
pub mod marker;
pub mod pom;
pub mod types;

pub use config::Config;
pub use goals::{Goal, Pipeline};
pub use types::*;
