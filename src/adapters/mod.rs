pub mod kube_rest;
pub mod memory_store;
pub mod monitoring_api;

pub use kube_rest::{IngressObject, KubeRestStore, MonitorObject};
pub use memory_store::InMemoryStore;
pub use monitoring_api::HttpMonitoringClient;
