//! Bot tenants known to this process.

mod registry;

pub use registry::{BotDirectory, BotProfile, BotRegistry};
