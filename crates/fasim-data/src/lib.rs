//! Data-driven setup for fasim.
//!
//! Catalogs, production lines and driver settings are plain data files in
//! RON, JSON or TOML. [`schema`] holds their serde shapes, [`loader`] the
//! file plumbing, and [`resolve`] turns names into catalog ids and graph
//! nodes (and graphs back into line files).

pub mod loader;
pub mod resolve;
pub mod schema;

pub use loader::DataLoadError;
pub use resolve::{
    LoadedLine, SimulationData, load_catalog, load_config, load_directory, load_line, save_line,
};
