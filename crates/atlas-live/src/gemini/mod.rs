//! Google Gemini Live client.
//!
//! Implements `LiveConnector` over the BidiGenerateContent WebSocket API.

mod client;
mod wire;

pub use client::GeminiLiveConnector;
