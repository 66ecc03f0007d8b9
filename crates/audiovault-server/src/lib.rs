//! Audiovault Server - TCP receiver daemon for streaming audio devices
//!
//! Wires the core pipeline together: a TCP accept loop feeding per-device
//! receive threads, chunk processing and segment storage, and background
//! monitoring of the whole thing.

pub mod connection;
pub mod pipeline;
pub mod server;

pub use connection::DeviceConnection;
pub use pipeline::AudioPipeline;
pub use server::{ReceiverServer, ServerStats};
