pub mod application;
pub mod aws;
pub mod cli;
pub mod client;
pub mod eks;
pub mod handler;
pub mod logging;
pub mod token;

/// Region used when an invocation does not name one.
pub const DEFAULT_REGION: &str = "eu-west-1";
