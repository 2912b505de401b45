//! API data models
//!
//! Wire types of the OpenAI-compatible API used by every provider.

pub mod openai;
