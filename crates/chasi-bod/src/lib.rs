//! chasi-bod: provisions a Host Kubernetes cluster on bare nodes and runs
//! isolated tenant vclusters and their applications on top of it.

pub mod application;
pub mod cmd;
pub mod config;
pub mod deployer;
pub mod health;
pub mod infrastructure;
pub mod lifecycle;
pub mod platform;
pub mod state;
pub mod util;
pub mod vcluster;
