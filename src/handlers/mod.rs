mod health;
mod metrics;
mod generate;
mod status;

pub use health::health_handler;
pub use metrics::metrics_handler;
pub use generate::generate_handler;
pub use status::status_handler;
