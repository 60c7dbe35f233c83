//! Document models persisted as JSON.

pub mod mapping;
pub mod topic_config;

pub use self::mapping::*;
pub use self::topic_config::*;
