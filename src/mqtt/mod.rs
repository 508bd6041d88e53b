//! # MQTT Integration Module
//!
//! Everything that talks to the broker or interprets what it sends.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs        - Broker address parsing and connection options
//! ├── backoff.rs       - Exponential delay between reconnect attempts
//! ├── mqtt_handler.rs  - Connection state machine and transport events
//! ├── subscription.rs  - Subscribe on every (re)connect, track the SUBACK
//! └── decoder.rs       - Payload to integer light reading
//! ```
//!
//! ## Event flow
//!
//! The handler owns the rumqttc event loop and turns everything it sees into
//! [`mqtt_handler::TransportEvent`]s. It never touches monitor state itself;
//! subscription bookkeeping and decoding run on the engine task that consumes
//! those events, so every state change happens in one place and in arrival
//! order.

pub mod backoff;
pub mod config;
pub mod decoder;
pub mod mqtt_handler;
pub mod subscription;
