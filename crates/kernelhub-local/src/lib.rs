pub mod config;
pub mod router;

pub use config::HostConfig;
pub use router::Router;
