//! Static provider and model tables, loaded once at startup and read-only
//! afterwards.

/// Which response dialect an upstream speaks. Mistral is openai-shaped
/// plus a fenced-JSON unwrap on unary content.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Family {
    OpenAi,
    Anthropic,
    Google,
    Mistral,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthScheme {
    /// `Authorization: Bearer <token>`
    Bearer,
    /// `x-api-key: <token>`
    ApiKeyHeader,
    /// `?key=<token>` appended to the URL (Google AI Studio).
    QueryParam,
}

pub const INTERNAL_PROVIDER: &str = "llmgateway";

#[derive(Clone, Debug)]
pub struct ProviderDef {
    pub id: &'static str,
    pub name: &'static str,
    /// Default upstream origin; stored keys may override it.
    pub base_url: &'static str,
    pub auth: AuthScheme,
    pub family: Family,
    /// Whether aborting the upstream request mid-stream is safe.
    pub cancellation: bool,
    pub env_var: Option<&'static str>,
}

impl ProviderDef {
    /// Chat endpoint for this provider. Google paths embed the model and
    /// switch verbs between unary and streaming.
    pub fn chat_url(&self, base_override: Option<&str>, model: &str, stream: bool) -> String {
        let base = base_override
            .unwrap_or(self.base_url)
            .trim_end_matches('/')
            .to_string();
        match self.family {
            Family::OpenAi | Family::Mistral => format!("{base}/chat/completions"),
            Family::Anthropic => format!("{base}/v1/messages"),
            Family::Google => {
                let verb = if stream {
                    "streamGenerateContent"
                } else {
                    "generateContent"
                };
                format!("{base}/v1beta/models/{model}:{verb}")
            }
        }
    }
}

/// Flat micro-USD prices per million tokens.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Price {
    pub input: u64,
    pub output: u64,
    pub cached_input: Option<u64>,
    pub image: Option<u64>,
    /// Micro-USD charged per request regardless of tokens.
    pub per_request: Option<u64>,
}

/// A context-size-ranged pricing tier. Both bounds are inclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PriceTier {
    pub min_context: u32,
    pub max_context: u32,
    pub input: u64,
    pub output: u64,
}

#[derive(Clone, Debug)]
pub struct ProviderMapping {
    pub provider_id: &'static str,
    pub provider_model: &'static str,
    pub price: Price,
    pub tiers: Vec<PriceTier>,
    pub context_size: u32,
    pub max_output: u32,
    pub streaming: bool,
    pub vision: bool,
    pub reasoning: bool,
}

#[derive(Clone, Debug)]
pub struct ModelDef {
    pub id: &'static str,
    pub json_output: bool,
    /// Epoch millis; deprecated models are skipped by `auto` routing but
    /// still served.
    pub deprecated_at: Option<u64>,
    /// Epoch millis; deactivated models are rejected with 410.
    pub deactivated_at: Option<u64>,
    pub mappings: Vec<ProviderMapping>,
}

impl ModelDef {
    pub fn mapping_for(&self, provider_id: &str) -> Option<&ProviderMapping> {
        self.mappings
            .iter()
            .find(|mapping| mapping.provider_id == provider_id)
    }
}

#[derive(Debug)]
pub struct Catalog {
    providers: Vec<ProviderDef>,
    models: Vec<ModelDef>,
}

impl Catalog {
    pub fn builtin() -> Self {
        Self {
            providers: builtin_providers(),
            models: builtin_models(),
        }
    }

    pub fn providers(&self) -> &[ProviderDef] {
        &self.providers
    }

    /// Models in declared order; `auto` routing depends on this order.
    pub fn models(&self) -> &[ModelDef] {
        &self.models
    }

    pub fn find_provider(&self, id: &str) -> Option<&ProviderDef> {
        self.providers.iter().find(|provider| provider.id == id)
    }

    pub fn lookup_model(&self, id: &str) -> Option<&ModelDef> {
        self.models.iter().find(|model| model.id == id)
    }

    /// Reverse lookup by a provider-native model name. Used to tell "this
    /// is a real model, but you must say provider/model" apart from an
    /// unknown string.
    pub fn lookup_model_by_provider_model_name(
        &self,
        name: &str,
    ) -> Option<(&ModelDef, &ProviderMapping)> {
        for model in &self.models {
            for mapping in &model.mappings {
                if mapping.provider_model == name {
                    return Some((model, mapping));
                }
            }
        }
        None
    }

    pub fn streaming_supported(&self, model_id: &str, provider_id: &str) -> bool {
        self.lookup_model(model_id)
            .and_then(|model| model.mapping_for(provider_id))
            .map(|mapping| mapping.streaming)
            .unwrap_or(false)
    }

    pub fn reasoning_supported(&self, model_id: &str) -> bool {
        self.lookup_model(model_id)
            .map(|model| model.mappings.iter().any(|mapping| mapping.reasoning))
            .unwrap_or(false)
    }

    pub fn json_output_supported(&self, model_id: &str) -> bool {
        self.lookup_model(model_id)
            .map(|model| model.json_output)
            .unwrap_or(false)
    }

    pub fn is_deprecated(&self, model_id: &str, now_ms: u64) -> bool {
        self.lookup_model(model_id)
            .and_then(|model| model.deprecated_at)
            .map(|at| at <= now_ms)
            .unwrap_or(false)
    }

    pub fn is_deactivated(&self, model_id: &str, now_ms: u64) -> bool {
        self.lookup_model(model_id)
            .and_then(|model| model.deactivated_at)
            .map(|at| at <= now_ms)
            .unwrap_or(false)
    }

    /// The price to apply for a prompt of `context_tokens`: the tier whose
    /// inclusive range contains it, else the flat mapping price.
    pub fn price_for(
        &self,
        model_id: &str,
        provider_id: &str,
        context_tokens: u32,
    ) -> Option<Price> {
        let mapping = self.lookup_model(model_id)?.mapping_for(provider_id)?;
        Some(effective_price(mapping, context_tokens))
    }
}

pub fn effective_price(mapping: &ProviderMapping, context_tokens: u32) -> Price {
    for tier in &mapping.tiers {
        if context_tokens >= tier.min_context && context_tokens <= tier.max_context {
            return Price {
                input: tier.input,
                output: tier.output,
                ..mapping.price
            };
        }
    }
    mapping.price
}

fn builtin_providers() -> Vec<ProviderDef> {
    vec![
        ProviderDef {
            id: "openai",
            name: "OpenAI",
            base_url: "https://api.openai.com/v1",
            auth: AuthScheme::Bearer,
            family: Family::OpenAi,
            cancellation: true,
            env_var: Some("OPENAI_API_KEY"),
        },
        ProviderDef {
            id: "anthropic",
            name: "Anthropic",
            base_url: "https://api.anthropic.com",
            auth: AuthScheme::ApiKeyHeader,
            family: Family::Anthropic,
            cancellation: true,
            env_var: Some("ANTHROPIC_API_KEY"),
        },
        ProviderDef {
            id: "google-ai-studio",
            name: "Google AI Studio",
            base_url: "https://generativelanguage.googleapis.com",
            auth: AuthScheme::QueryParam,
            family: Family::Google,
            cancellation: true,
            env_var: Some("GOOGLE_AI_STUDIO_API_KEY"),
        },
        ProviderDef {
            id: "google-vertex",
            name: "Google Vertex",
            base_url: "https://aiplatform.googleapis.com",
            auth: AuthScheme::Bearer,
            family: Family::Google,
            cancellation: true,
            env_var: Some("GOOGLE_VERTEX_API_KEY"),
        },
        ProviderDef {
            id: "mistral",
            name: "Mistral",
            base_url: "https://api.mistral.ai/v1",
            auth: AuthScheme::Bearer,
            family: Family::Mistral,
            cancellation: true,
            env_var: Some("MISTRAL_API_KEY"),
        },
        ProviderDef {
            id: "deepseek",
            name: "DeepSeek",
            base_url: "https://api.deepseek.com/v1",
            auth: AuthScheme::Bearer,
            family: Family::OpenAi,
            cancellation: true,
            env_var: Some("DEEPSEEK_API_KEY"),
        },
        ProviderDef {
            id: "perplexity",
            name: "Perplexity",
            base_url: "https://api.perplexity.ai",
            auth: AuthScheme::Bearer,
            family: Family::OpenAi,
            cancellation: false,
            env_var: Some("PERPLEXITY_API_KEY"),
        },
        ProviderDef {
            id: "groq",
            name: "Groq",
            base_url: "https://api.groq.com/openai/v1",
            auth: AuthScheme::Bearer,
            family: Family::OpenAi,
            cancellation: true,
            env_var: Some("GROQ_API_KEY"),
        },
        ProviderDef {
            id: "together",
            name: "Together",
            base_url: "https://api.together.xyz/v1",
            auth: AuthScheme::Bearer,
            family: Family::OpenAi,
            cancellation: true,
            env_var: Some("TOGETHER_API_KEY"),
        },
        ProviderDef {
            id: "inference-net",
            name: "Inference.net",
            base_url: "https://api.inference.net/v1",
            auth: AuthScheme::Bearer,
            family: Family::OpenAi,
            cancellation: true,
            env_var: Some("INFERENCE_NET_API_KEY"),
        },
        ProviderDef {
            id: "alibaba",
            name: "Alibaba",
            base_url: "https://dashscope-intl.aliyuncs.com/compatible-mode/v1",
            auth: AuthScheme::Bearer,
            family: Family::OpenAi,
            cancellation: false,
            env_var: Some("ALIBABA_API_KEY"),
        },
        ProviderDef {
            id: "xai",
            name: "xAI",
            base_url: "https://api.x.ai/v1",
            auth: AuthScheme::Bearer,
            family: Family::OpenAi,
            cancellation: true,
            env_var: Some("XAI_API_KEY"),
        },
        ProviderDef {
            id: "moonshot",
            name: "Moonshot",
            base_url: "https://api.moonshot.ai/v1",
            auth: AuthScheme::Bearer,
            family: Family::OpenAi,
            cancellation: false,
            env_var: Some("MOONSHOT_API_KEY"),
        },
        ProviderDef {
            id: "meta",
            name: "Meta",
            base_url: "https://api.llama.com/compat/v1",
            auth: AuthScheme::Bearer,
            family: Family::OpenAi,
            cancellation: true,
            env_var: Some("META_API_KEY"),
        },
        // Internal meta-provider backing operator-defined custom
        // OpenAI-compatible endpoints. Never routable from env credentials.
        ProviderDef {
            id: INTERNAL_PROVIDER,
            name: "LLM Gateway",
            base_url: "",
            auth: AuthScheme::Bearer,
            family: Family::OpenAi,
            cancellation: true,
            env_var: None,
        },
    ]
}

fn flat(input: u64, output: u64) -> Price {
    Price {
        input,
        output,
        ..Price::default()
    }
}

fn builtin_models() -> Vec<ModelDef> {
    vec![
        // First non-deprecated entry: the `auto` pick whenever its
        // provider is available.
        ModelDef {
            id: "gpt-4o-mini",
            json_output: true,
            deprecated_at: None,
            deactivated_at: None,
            mappings: vec![ProviderMapping {
                provider_id: "openai",
                provider_model: "gpt-4o-mini",
                price: Price {
                    input: 150_000,
                    output: 600_000,
                    cached_input: Some(75_000),
                    ..Price::default()
                },
                tiers: Vec::new(),
                context_size: 128_000,
                max_output: 16_384,
                streaming: true,
                vision: true,
                reasoning: false,
            }],
        },
        ModelDef {
            id: "gpt-4o",
            json_output: true,
            deprecated_at: None,
            deactivated_at: None,
            mappings: vec![ProviderMapping {
                provider_id: "openai",
                provider_model: "gpt-4o",
                price: Price {
                    input: 2_500_000,
                    output: 10_000_000,
                    cached_input: Some(1_250_000),
                    ..Price::default()
                },
                tiers: Vec::new(),
                context_size: 128_000,
                max_output: 16_384,
                streaming: true,
                vision: true,
                reasoning: false,
            }],
        },
        ModelDef {
            id: "o1",
            json_output: false,
            deprecated_at: None,
            deactivated_at: None,
            mappings: vec![ProviderMapping {
                provider_id: "openai",
                provider_model: "o1",
                price: Price {
                    input: 15_000_000,
                    output: 60_000_000,
                    cached_input: Some(7_500_000),
                    ..Price::default()
                },
                tiers: Vec::new(),
                context_size: 200_000,
                max_output: 100_000,
                streaming: false,
                vision: true,
                reasoning: true,
            }],
        },
        ModelDef {
            id: "claude-opus-4-0",
            json_output: true,
            deprecated_at: None,
            deactivated_at: None,
            mappings: vec![ProviderMapping {
                provider_id: "anthropic",
                provider_model: "claude-opus-4-0",
                price: Price {
                    input: 15_000_000,
                    output: 75_000_000,
                    cached_input: Some(1_500_000),
                    ..Price::default()
                },
                tiers: Vec::new(),
                context_size: 200_000,
                max_output: 32_000,
                streaming: true,
                vision: true,
                reasoning: true,
            }],
        },
        ModelDef {
            id: "claude-sonnet-4-0",
            json_output: true,
            deprecated_at: None,
            deactivated_at: None,
            mappings: vec![ProviderMapping {
                provider_id: "anthropic",
                provider_model: "claude-sonnet-4-0",
                price: Price {
                    input: 3_000_000,
                    output: 15_000_000,
                    cached_input: Some(300_000),
                    ..Price::default()
                },
                tiers: Vec::new(),
                context_size: 200_000,
                max_output: 64_000,
                streaming: true,
                vision: true,
                reasoning: true,
            }],
        },
        ModelDef {
            id: "gemini-2.5-flash",
            json_output: true,
            deprecated_at: None,
            deactivated_at: None,
            mappings: vec![
                ProviderMapping {
                    provider_id: "google-ai-studio",
                    provider_model: "gemini-2.5-flash",
                    price: flat(300_000, 2_500_000),
                    tiers: Vec::new(),
                    context_size: 1_048_576,
                    max_output: 65_536,
                    streaming: true,
                    vision: true,
                    reasoning: true,
                },
                ProviderMapping {
                    provider_id: "google-vertex",
                    provider_model: "gemini-2.5-flash",
                    price: flat(300_000, 2_500_000),
                    tiers: Vec::new(),
                    context_size: 1_048_576,
                    max_output: 65_536,
                    streaming: true,
                    vision: true,
                    reasoning: true,
                },
            ],
        },
        ModelDef {
            id: "gemini-2.5-pro",
            json_output: true,
            deprecated_at: None,
            deactivated_at: None,
            mappings: vec![
                ProviderMapping {
                    provider_id: "google-ai-studio",
                    provider_model: "gemini-2.5-pro",
                    price: flat(1_250_000, 10_000_000),
                    tiers: vec![
                        PriceTier {
                            min_context: 0,
                            max_context: 200_000,
                            input: 1_250_000,
                            output: 10_000_000,
                        },
                        PriceTier {
                            min_context: 200_001,
                            max_context: 1_048_576,
                            input: 2_500_000,
                            output: 15_000_000,
                        },
                    ],
                    context_size: 1_048_576,
                    max_output: 65_536,
                    streaming: true,
                    vision: true,
                    reasoning: true,
                },
                ProviderMapping {
                    provider_id: "google-vertex",
                    provider_model: "gemini-2.5-pro",
                    price: flat(1_250_000, 10_000_000),
                    tiers: vec![
                        PriceTier {
                            min_context: 0,
                            max_context: 200_000,
                            input: 1_250_000,
                            output: 10_000_000,
                        },
                        PriceTier {
                            min_context: 200_001,
                            max_context: 1_048_576,
                            input: 2_500_000,
                            output: 15_000_000,
                        },
                    ],
                    context_size: 1_048_576,
                    max_output: 65_536,
                    streaming: true,
                    vision: true,
                    reasoning: true,
                },
            ],
        },
        ModelDef {
            id: "mistral-large-latest",
            json_output: true,
            deprecated_at: None,
            deactivated_at: None,
            mappings: vec![ProviderMapping {
                provider_id: "mistral",
                provider_model: "mistral-large-latest",
                price: flat(2_000_000, 6_000_000),
                tiers: Vec::new(),
                context_size: 128_000,
                max_output: 8_192,
                streaming: true,
                vision: false,
                reasoning: false,
            }],
        },
        ModelDef {
            id: "deepseek-chat",
            json_output: true,
            deprecated_at: None,
            deactivated_at: None,
            mappings: vec![ProviderMapping {
                provider_id: "deepseek",
                provider_model: "deepseek-chat",
                price: Price {
                    input: 270_000,
                    output: 1_100_000,
                    cached_input: Some(70_000),
                    ..Price::default()
                },
                tiers: Vec::new(),
                context_size: 65_536,
                max_output: 8_192,
                streaming: true,
                vision: false,
                reasoning: false,
            }],
        },
        ModelDef {
            id: "sonar",
            json_output: false,
            deprecated_at: None,
            deactivated_at: None,
            mappings: vec![ProviderMapping {
                provider_id: "perplexity",
                provider_model: "sonar",
                price: Price {
                    input: 1_000_000,
                    output: 1_000_000,
                    per_request: Some(5_000),
                    ..Price::default()
                },
                tiers: Vec::new(),
                context_size: 127_072,
                max_output: 4_096,
                streaming: true,
                vision: false,
                reasoning: false,
            }],
        },
        ModelDef {
            id: "llama-3.3-70b",
            json_output: true,
            deprecated_at: None,
            deactivated_at: None,
            mappings: vec![
                ProviderMapping {
                    provider_id: "groq",
                    provider_model: "llama-3.3-70b-versatile",
                    price: flat(590_000, 790_000),
                    tiers: Vec::new(),
                    context_size: 128_000,
                    max_output: 32_768,
                    streaming: true,
                    vision: false,
                    reasoning: false,
                },
                ProviderMapping {
                    provider_id: "together",
                    provider_model: "meta-llama/Llama-3.3-70B-Instruct-Turbo",
                    price: flat(880_000, 880_000),
                    tiers: Vec::new(),
                    context_size: 131_072,
                    max_output: 4_096,
                    streaming: true,
                    vision: false,
                    reasoning: false,
                },
                ProviderMapping {
                    provider_id: "meta",
                    provider_model: "Llama-3.3-70B-Instruct",
                    price: flat(900_000, 900_000),
                    tiers: Vec::new(),
                    context_size: 128_000,
                    max_output: 4_096,
                    streaming: true,
                    vision: false,
                    reasoning: false,
                },
            ],
        },
        ModelDef {
            id: "qwen-max",
            json_output: true,
            deprecated_at: None,
            deactivated_at: None,
            mappings: vec![ProviderMapping {
                provider_id: "alibaba",
                provider_model: "qwen-max",
                price: flat(1_600_000, 6_400_000),
                tiers: Vec::new(),
                context_size: 32_768,
                max_output: 8_192,
                streaming: true,
                vision: false,
                reasoning: false,
            }],
        },
        ModelDef {
            id: "grok-2",
            json_output: false,
            deprecated_at: None,
            deactivated_at: None,
            mappings: vec![ProviderMapping {
                provider_id: "xai",
                provider_model: "grok-2-1212",
                price: flat(2_000_000, 10_000_000),
                tiers: Vec::new(),
                context_size: 131_072,
                max_output: 8_192,
                streaming: true,
                vision: false,
                reasoning: false,
            }],
        },
        ModelDef {
            id: "kimi-k2",
            json_output: true,
            deprecated_at: None,
            deactivated_at: None,
            mappings: vec![ProviderMapping {
                provider_id: "moonshot",
                provider_model: "kimi-k2-0711-preview",
                price: flat(600_000, 2_500_000),
                tiers: Vec::new(),
                context_size: 131_072,
                max_output: 16_384,
                streaming: true,
                vision: false,
                reasoning: false,
            }],
        },
        ModelDef {
            id: "gpt-3.5-turbo",
            json_output: true,
            // 2024-09-01T00:00:00Z
            deprecated_at: Some(1_725_148_800_000),
            deactivated_at: None,
            mappings: vec![ProviderMapping {
                provider_id: "openai",
                provider_model: "gpt-3.5-turbo",
                price: flat(500_000, 1_500_000),
                tiers: Vec::new(),
                context_size: 16_385,
                max_output: 4_096,
                streaming: true,
                vision: false,
                reasoning: false,
            }],
        },
        ModelDef {
            id: "claude-2.1",
            json_output: false,
            // 2024-11-01T00:00:00Z deprecated, 2025-07-21T00:00:00Z retired
            deprecated_at: Some(1_730_419_200_000),
            deactivated_at: Some(1_753_056_000_000),
            mappings: vec![ProviderMapping {
                provider_id: "anthropic",
                provider_model: "claude-2.1",
                price: flat(8_000_000, 24_000_000),
                tiers: Vec::new(),
                context_size: 200_000,
                max_output: 4_096,
                streaming: true,
                vision: false,
                reasoning: false,
            }],
        },
    ]
}
