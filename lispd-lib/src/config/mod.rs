mod loader;
mod root;

pub use loader::load_from_path;
pub use root::{
    Config, DeviceMode, EidConfig, InterfaceConfig, MapResolverConfig, MapServerConfig, RtrConfig,
    SiteConfig,
};
