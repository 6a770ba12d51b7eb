//! Desktop launcher for a locally hosted web UI server: installs a standalone runtime and
//! the server package, supervises the server process and bridges requests to it.

pub mod api;
pub mod commands;
pub mod config;
pub mod controller;
pub mod download;
mod logs;
pub mod package_manager;
pub mod paths;
pub mod port_probe;
pub mod process_tree;
pub mod proxy;
pub mod reachability;
pub mod ready_signal;
pub mod runtime_install;
pub mod secret_key;
pub mod supervisor;

#[cfg(test)]
mod test_support;

pub use commands::Launcher;
pub use controller::ServerController;
pub use supervisor::StartError;
