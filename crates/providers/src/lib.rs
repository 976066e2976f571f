//! LLM provider interface for Switchboard.
//!
//! Concrete provider integrations (HTTP adapters, prompt templating) live
//! outside the core; this crate defines the contract the runtime consumes
//! plus a scriptable mock used throughout the test suites.

pub mod mock;
pub mod traits;

pub use mock::{EchoProvider, MockProvider};
pub use traits::{ChatRequest, ChatResponse, LlmProvider};
