pub mod app;

pub use app::handler::{Handshake, InvocationEvent, InvocationRequest, Outcome, Status};
