//! Firecracker process supervision (§4.6): launch under a detached
//! multiplexer session, discover its PID, and stop it on request.

pub mod supervisor;

pub use supervisor::ProcessSupervisor;
