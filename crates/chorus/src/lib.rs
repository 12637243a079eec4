//! Chorus backend library.
//!
//! Routes voice playback commands for many independent guild sessions
//! across a fleet of worker nodes. Three processes cooperate over
//! message passing: the hub admits and health-tracks agents and routes
//! each session to the least-loaded one, an agent supervises one
//! isolated worker process per active session on its node, and a
//! worker drives the voice transport and audio encoder for exactly one
//! session.

pub mod agent;
pub mod hub;
pub mod sys;
pub mod voice;
pub mod worker;

pub use chorus_protocol as protocol;
