#![forbid(unsafe_code)]

pub mod auth;
pub mod config;
pub mod ctrl;
pub mod error;
pub mod msg;
pub mod nonce;
pub mod store;
pub mod timers;

pub use config::{load_from_path, Config, DeviceMode, MapServerConfig};
pub use ctrl::{run, Daemon, DataPlaneIntent, ExternalEvent};
pub use error::{LispError, Result};
pub use msg::{Address, Message};
pub use store::{EidPrefix, Locator, LocatorState, MapReplyAction, Mapping};
