pub mod config;
pub mod contracts;
pub mod documents;
pub mod ingest;
pub mod pipeline;
pub mod routes;
pub mod sinks;

pub use ingest::IngestHandler;
pub use routes::{build_router, AppState};
