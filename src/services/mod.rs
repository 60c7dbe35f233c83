pub mod bridge;
pub mod chat;
pub mod eventsub;
pub mod fingerprint;
pub mod followers;
pub mod init;
pub mod irc;
pub mod mappings;
pub mod normalizer;
pub mod notifications;
pub mod session;
pub mod subscriptions;
pub mod twitch;

#[cfg(test)]
pub mod testing;
