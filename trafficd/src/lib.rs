// trafficd - per-uid traffic accounting and firewall over pinned BPF maps

pub mod bpf;
pub mod config;
pub mod controller;
pub mod error;
pub mod legacy;
pub mod listener;
mod sys;

pub use config::Config;
pub use controller::TrafficController;
pub use error::TrafficError;
pub use listener::SkDestroyListener;
