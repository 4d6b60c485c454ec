pub mod openai;
pub mod prompts;
pub mod provider;
pub mod simulated;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::LlmConfig;

pub use openai::{ChatCompletionsConfig, ChatCompletionsProvider, ProviderConfigError};
pub use prompts::{PromptLimits, assemble_prompt, estimate_tokens, truncate_chars};
pub use provider::{
    CompletionError, CompletionProvider, CompletionRequest, FragmentStream, PromptMessage,
    PromptRole, ProviderFuture,
};
pub use simulated::SimulatedProvider;

/// Selects the offline simulator or the live chat completions client.
pub fn provider_from_config(
    config: &LlmConfig,
) -> Result<Arc<dyn CompletionProvider>, ProviderConfigError> {
    if config.simulation_mode {
        info!(
            delay_ms = config.simulation_delay_ms,
            "llm simulation mode enabled"
        );
        return Ok(Arc::new(SimulatedProvider::new(Duration::from_millis(
            config.simulation_delay_ms,
        ))));
    }

    info!(
        model = %config.model,
        url = %config.chat_completions_url,
        "using chat completions provider"
    );
    Ok(Arc::new(ChatCompletionsProvider::new(
        ChatCompletionsConfig::from(config),
    )?))
}
