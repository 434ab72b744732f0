//! Command implementations for the Conduit CLI

pub mod serve;
