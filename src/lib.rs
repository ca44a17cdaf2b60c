pub mod catalog;
pub mod config;
pub mod error;
pub mod loader;
pub mod master;
pub mod metrics;
pub mod model;
pub mod output;
pub mod persistence;
pub mod rpc;
pub mod velocity;
pub mod worker;

pub mod proto {
    include!(concat!(env!("OUT_DIR"), "/velocity.rs"));
}
