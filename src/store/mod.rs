pub mod agents;
pub mod capsules;
pub mod claims;
pub mod db;
pub mod episodes;
pub mod events;
pub mod lease;
pub mod lock;
pub mod messages;
pub mod paths;
pub mod repo;
pub mod tasks;
pub mod waiters;
