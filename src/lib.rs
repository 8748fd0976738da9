pub mod anchor;
pub mod bundle;
pub mod config;
pub mod crypto;
pub mod error;
pub mod notify;
pub mod pipeline;
pub mod server;
pub mod state;
pub mod storage;
pub mod verify;

#[cfg(test)]
mod testing;
