pub mod config;
pub mod directory;
pub mod error;
pub mod persistence;
pub mod registry;
pub mod session;
pub mod transport;
pub mod ui;
pub mod version;
