pub mod agent;
pub mod claim;
pub mod commit;
pub mod episode;
pub mod events;
pub mod init;
pub mod key;
pub mod msg;
pub mod orch;
pub mod watchdog;
pub mod weave;
pub mod witness;
