pub mod config_loader;
pub mod coordinator;
pub mod jenkins;
pub mod keys;
pub mod ngrok;
pub mod orchestrator;
pub mod plugins;
pub mod poll;
pub mod process;
pub mod provisioner;
pub mod runtime;
pub mod state;
pub mod tunnel;
pub mod workers;
