pub mod backends;
pub mod orchestrator;
pub mod stuck;

pub use backends::{
    AnthropicBackend, BackendResponse, CompletionRequest, FinishReason, LLMBackend, MockBackend,
    OllamaBackend, OpenAIBackend,
};
pub use orchestrator::{
    BackendDescriptor, BackendHealth, BackendUsage, Completion, Complexity, HealthState,
    ModelOrchestrator, OrchestratorSettings, Usage,
};
pub use stuck::{NextStep, StuckPolicy, StuckReason};
