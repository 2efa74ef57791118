//! Idlegate - a TCP proxy that runs its backend only while it is needed
//!
//! This library provides:
//! - A byte-transparent TCP proxy that reports every session's start and end
//! - A connection controller that launches the backend on the first
//!   connection and shuts it down once it has been idle for a grace period
//! - Launchers for a fixed, externally managed backend and for a backend
//!   started as a child process
//!
//! The controller and the process launcher are actors: each owns its state on
//! a single task and is driven through a queue of actions.

pub mod config;
pub mod controller;
pub mod error;
pub mod launcher;
pub mod process;
pub mod proxy;
