pub mod asyncutil;
pub mod build_info;
pub mod child;
pub mod cli;
pub mod cron;
pub mod daemon;
pub mod error;
pub mod events;
pub mod health;
pub mod ipc;
pub mod logs;
pub mod monitor;
pub mod paths;
pub mod persist;
pub mod registry;
pub mod reload;
pub mod service;
pub mod spec;
pub mod supervisor;
pub mod watcher;
