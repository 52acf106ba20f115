pub mod cli;
pub mod config;
pub mod error;
pub mod geo;
mod metrics;
pub mod pyramid;
pub mod raster;
pub mod relabel;
pub mod search;
pub mod server;
pub mod tiles;
pub mod utils;

pub use config::Opts;
pub use error::{Error, Result};
