//! Receive side - listener, connection tasks and session assembly.

mod assembler;
mod server;

pub use assembler::{
    Endpoints, SessionAssembler, SessionEvent, RECEIVER_ATTRIBUTE, RECEIVER_PORT_ATTRIBUTE,
    SENDER_ATTRIBUTE,
};
pub use server::{FlowServer, SessionNotification, MAX_DATAGRAM_SIZE};
