#![doc = include_str!("../README.md")]
pub mod client;
pub mod network;
pub mod party;
pub mod preprocessing;
pub mod query;
pub mod share;
pub mod table;
