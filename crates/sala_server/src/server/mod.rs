#![forbid(unsafe_code)]

pub mod codec;
pub mod connection;
pub mod health;
pub mod relay;
pub mod room_hub;
pub mod roster;
pub mod sessions;
pub mod store;
pub mod sweeper;

#[cfg(test)]
mod relay_tests;
