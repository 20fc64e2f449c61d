//! An in-memory work queue broker speaking the beanstalkd protocol.
//!
//! The [`broker`] module holds the job lifecycle engine; everything else is
//! protocol plumbing around it.
pub mod broker;
pub mod line_reader;
pub mod parser;
pub mod server;
pub mod session;
pub mod types;
pub mod util;
