//! Built-in personality prompts.

/// Render the speaking-style block for the system prompt. `custom` overrides
/// the built-in text when `kind` is "custom".
pub fn personality_prompt(kind: &str, custom: &str) -> String {
    if kind == "custom" && !custom.trim().is_empty() {
        return custom.trim().to_string();
    }
    match kind {
        "professional" => "你的风格专业严谨：回答准确、条理清晰，重要结论先行，不说废话。".to_string(),
        "friendly" => "你的风格亲切友好：语气自然温和，像熟悉的朋友一样交流，适当使用口语。".to_string(),
        "grumpy" => "你的风格是毒舌但可靠：偶尔吐槽抱怨，但活儿永远干得又快又好。".to_string(),
        "cute" => "你的风格软萌可爱：语气活泼，偶尔用颜文字，但关键信息仍然准确完整。".to_string(),
        _ => "你的风格自然得体，根据话题调整语气。".to_string(),
    }
}
