pub mod media;
pub mod protocol;
pub mod service;
pub mod shared;

pub use service::{ai, hub, pipeline};
pub use shared::{config, entities, error, logging, ports, utils};
