//! Control channel server
//!
//! Clients establish one TCP connection each and speak line-delimited JSON.
//! Every session runs a reader task (framing, dispatch) and a writer task
//! draining its outbound mailbox; shared state lives in [`HubState`].

pub mod control;
pub mod mailbox;
mod session;

pub use control::{ControlServer, HubState};
pub use mailbox::Mailbox;
