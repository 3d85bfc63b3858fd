//! Vehicle command execution for the widget agent
//!
//! This module handles:
//! - Rejecting commands while another is in flight
//! - Driving one attempt from radio check to acknowledgment
//! - Enforcing the connection and write deadlines
//! - Recording the outcome in the shared widget state

mod executor;
mod session;
mod timer;

pub use executor::{CommandConfig, VehicleCommander};
pub use session::CommandOutcome;
