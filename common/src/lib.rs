pub mod config;
pub mod defs;
pub mod fork_server;
pub mod pipe;
pub mod shm;
pub mod tsl;
