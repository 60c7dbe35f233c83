pub mod mapping;
pub mod topic_config;

pub use mapping::MappingRepository;
pub use topic_config::TopicConfigRepository;
