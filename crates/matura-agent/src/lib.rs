mod anthropic_provider;

pub use anthropic_provider::AnthropicProvider;
