pub mod key;
pub mod monitor;
pub mod phase;
pub mod route;

pub use key::*;
pub use monitor::*;
pub use phase::*;
pub use route::*;
