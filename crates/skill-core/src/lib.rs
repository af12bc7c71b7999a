pub mod config;
pub mod installed;
pub mod messages;
pub mod types;

pub use config::Config;
pub use installed::InstalledSetStore;
pub use messages::Message;
pub use types::*;
