pub mod config;
pub mod cors;
pub mod error;
pub mod forward;
pub mod general;
pub mod hls;
pub mod location;
pub mod media;
pub mod rate_limit;
pub mod router;
pub mod segment;
pub mod suffixes;
pub mod tls;
pub mod upstream;
pub mod validate;

pub use config::Config;
pub use router::{AppState, build_router};
