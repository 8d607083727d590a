//! Model service implementations for DevAssist.
//!
//! All providers implement the `devassist_core::ModelProvider` trait.
//! [`build_from_config`] selects one based on configuration.

pub mod openai_compat;
pub mod router;

pub use openai_compat::OpenAiCompatProvider;
pub use router::build_from_config;
