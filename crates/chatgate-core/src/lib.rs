//! Provider-agnostic chat completions with response caching and an ordered
//! fallback chain across vendors.

pub mod cache;
pub mod config;
pub mod error;
pub mod fallback;
pub mod layer;
pub mod provider;
pub mod service;
pub mod types;
pub mod util;

pub use error::{GatewayError, Result};
pub use layer::{AbstractionLayer, AbstractionLayerBuilder};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
