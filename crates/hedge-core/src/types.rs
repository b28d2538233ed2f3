//! Core domain types for the hedge coordination engines.

pub mod account;
pub mod action;
pub mod command;
pub mod position;

pub use account::*;
pub use action::*;
pub use command::*;
pub use position::*;
