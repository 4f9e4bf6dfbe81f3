pub mod health;
pub mod metrics;

pub use health::{HealthResponse, HealthServer, HealthState, HealthStatus};
pub use metrics::Metrics;
