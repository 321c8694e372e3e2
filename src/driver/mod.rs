pub mod commands;
pub mod demo;
pub mod error;
pub mod options;
pub mod statistics;
