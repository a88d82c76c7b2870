#![allow(dead_code)]

pub mod config;
pub mod engine;
pub mod monitor;
pub mod transfer;

pub use engine::Engine;
pub use monitor::ConnectivityEvent;
pub use transfer::{RetryPolicy, TransferCoordinator, TransferError};
