//! Language-model providers and the stage that runs the tool-calling loop.

pub mod openai_compat;
pub mod policy;
pub mod stage;
pub mod traits;

pub use openai_compat::{OpenAiCompatProvider, ProviderClientConfig};
pub use policy::{ToolChoice, ToolPolicy};
pub use stage::ProviderStage;
pub use traits::{Provider, ProviderCapabilities, ProviderRequest, ProviderResponse, StreamChunk};
