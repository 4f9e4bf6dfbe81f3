//! routewatch: keeps uptime monitors in sync with cluster ingress routes
//!
//! The route watcher turns each route into a Monitor record; the monitor
//! lifecycle reconciler mirrors Monitor records into an external monitoring
//! service and guards their removal with a finalizer.

pub mod adapters;
pub mod cli;
pub mod config;
pub mod controller;
pub mod desired;
pub mod domain;
pub mod error;
pub mod monitoring;
pub mod ownership;
pub mod services;
pub mod store;

pub use config::AppConfig;
pub use controller::{MonitorLifecycleReconciler, Operator, RouteWatcher};
pub use error::{OperatorError, Result};
