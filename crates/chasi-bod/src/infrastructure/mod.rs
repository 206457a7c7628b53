pub mod k8s;
pub mod process;
pub mod remote;
