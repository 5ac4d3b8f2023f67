//! # Meridian Server Library
//!
//! Startup helpers and demo job kinds for the Meridian job server.

pub mod demo;
pub mod startup;
