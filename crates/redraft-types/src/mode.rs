use serde::{Deserialize, Serialize};

/// A named prompt template applied to the shared input text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Mode {
    pub name: String,
    pub instruction: String,
}

impl Mode {
    pub fn new(name: impl Into<String>, instruction: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instruction: instruction.into(),
        }
    }
}

/// The built-in mode table. Order is significant: `run_all` enqueues modes in
/// this order.
pub fn builtin_modes() -> Vec<Mode> {
    vec![
        Mode::new(
            "Proofread",
            "You are a grammar proofreading assistant. Output ONLY the corrected text without any additional comments. Maintain the original text structure and writing style. Respond in the same language as the input (e.g., English US, French):",
        ),
        Mode::new(
            "Summarise",
            "Provide summary in bullet points for the following text:",
        ),
        Mode::new("Explain", "Can you explain the following:"),
        Mode::new(
            "Rewrite",
            "You are a writing assistant. Rewrite the text provided by the user to improve phrasing. Output ONLY the rewritten text without additional comments. Respond in the same language as the input (e.g., English US, French):",
        ),
        Mode::new(
            "Professional",
            "You are a writing assistant. Rewrite the text provided by the user to sound more professional. Output ONLY the professional text without additional comments. Respond in the same language as the input (e.g., English US, French):",
        ),
        Mode::new(
            "Friendly",
            "You are a writing assistant. Rewrite the text provided by the user to be more friendly. Output ONLY the friendly text without additional comments. Respond in the same language as the input (e.g., English US, French):",
        ),
        Mode::new(
            "Concise",
            "You are a writing assistant. Rewrite the text provided by the user to be slightly more concise in tone, thus making it just a bit shorter. Do not change the text too much or be too reductive. Output ONLY the concise version without additional comments. Respond in the same language as the input (e.g., English US, French):",
        ),
        Mode::new(
            "Fallacy Finder",
            "I want you to act as a fallacy finder. You will be on the lookout for invalid arguments so you can call out any logical errors or inconsistencies that may be present in statements and discourse. Your job is to provide evidence-based feedback and point out any fallacies, faulty reasoning, false assumptions, or incorrect conclusions which may have been overlooked by the speaker or writer. Text:",
        ),
        Mode::new(
            "Answer It",
            "You are an intelligent assistant. Help user with the query. Query:",
        ),
    ]
}

/// Build the prompt sent to the generation endpoint for one mode.
pub fn build_prompt(mode: &Mode, input: &str) -> String {
    if mode.instruction.is_empty() {
        return input.to_string();
    }
    format!("{}\n\n{}", mode.instruction, input)
}

const REFINE_INSTRUCTION: &str = "Review all the following alternative sentences and create a single, concise response that combines the strongest elements from each alternative. Preserve the exact tone and intent of the original sentences. Your output should contain ONLY the final consolidated response, with no additional commentary, explanations, or meta-text. Respond in the same language as the input:";

/// Build the one-shot consolidation prompt over combined mode outputs.
pub fn build_refine_prompt(combined: &str) -> String {
    format!("{REFINE_INSTRUCTION}\n\n{combined}")
}
