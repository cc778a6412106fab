use courier_llm::DEFAULT_OPENAI_MODEL;

pub const DEFAULT_INSTRUCTION: &str = "You are a helpful assistant.";
pub const DEFAULT_FAILURE_NOTICE: &str = "⚠️ Error: Could not connect to AI service.";

/// Runtime knobs the engine reads when it builds reply requests and failure notices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub model_id: String,
    /// Used when a generated conversation carries no instruction of its own.
    pub default_instruction: String,
    pub failure_notice: String,
    pub max_tokens: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_OPENAI_MODEL.to_string(),
            default_instruction: DEFAULT_INSTRUCTION.to_string(),
            failure_notice: DEFAULT_FAILURE_NOTICE.to_string(),
            max_tokens: None,
        }
    }
}

impl EngineConfig {
    pub fn instruction_for<'a>(&'a self, instruction: Option<&'a str>) -> &'a str {
        instruction
            .filter(|instruction| !instruction.trim().is_empty())
            .unwrap_or(&self.default_instruction)
    }
}
