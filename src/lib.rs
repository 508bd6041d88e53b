//! Messaging core of the headlight dashboard.
//!
//! Connects to an MQTT broker, subscribes to the light sensor topic, decodes
//! each reading and raises a low-light alert with a single voice announcement
//! per episode. Every change is published as one immutable snapshot.

pub mod alert;
pub mod announcer;
pub mod config;
pub mod monitor;
pub mod mqtt;
pub mod publisher;
