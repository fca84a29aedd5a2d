// CareLog Engine - Core module structure
pub mod api;
pub mod audit;
pub mod backup;
pub mod cli;
pub mod config;
pub mod database;
pub mod error;
pub mod installation;
pub mod keystore;
pub mod locks;
pub mod restore;
pub mod signal;

pub use config::Config;
pub use database::Database;
pub use installation::Installation;
