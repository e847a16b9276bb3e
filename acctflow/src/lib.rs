//! acctflow - account-event pipeline library
//!
//! Producer side: [`generator`], [`producer`], [`scheduler`] and [`load`], controlled
//! over HTTP by [`control`]. Consumer side: [`consumer`] lanes feed the
//! [`processor`], which records receipt and outcomes ([`recorder`], [`store`]), calls
//! the downstream service ([`downstream`]), retries by [`classify`] and [`retry`] and
//! routes failures through [`dead_letter`]. Both sides talk to Kafka through [`bus`],
//! [`kafka_bus`] and [`kafka_client`].

pub mod args;
pub mod bus;
pub mod classify;
pub mod consumer;
pub mod control;
pub mod dead_letter;
pub mod downstream;
pub mod generator;
pub mod headers;
pub mod kafka_bus;
pub mod kafka_client;
pub mod load;
pub mod model;
pub mod processor;
pub mod producer;
pub mod recorder;
pub mod reporter;
pub mod retry;
pub mod scheduler;
pub mod store;

pub use model::{AccountAction, AccountEvent, FailedMessage};
