//! System prompt composition.
//!
//! The prompt is assembled from: persona identity, personality style, the
//! skill catalog found in the workspace, the tail of the memory file, an
//! optional semantic-memory block injected by external integrations, and the
//! current local time. Composition is deterministic given the same inputs.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use countbot_core::config::PersonaConfig;
use countbot_memory::MemoryStore;

use crate::personalities::personality_prompt;

/// Memory lines included in every prompt.
const RECENT_MEMORY_LINES: usize = 10;

pub struct ContextBuilder {
    persona: RwLock<PersonaConfig>,
    memory: Arc<MemoryStore>,
    workspace: PathBuf,
    /// Extra context block supplied by an external semantic-memory service.
    semantic_context: RwLock<Option<String>>,
}

impl ContextBuilder {
    pub fn new(persona: PersonaConfig, memory: Arc<MemoryStore>, workspace: PathBuf) -> Self {
        Self {
            persona: RwLock::new(persona),
            memory,
            workspace,
            semantic_context: RwLock::new(None),
        }
    }

    /// Hot-reload the persona after a settings change.
    pub fn set_persona(&self, persona: PersonaConfig) {
        *self.persona.write().unwrap() = persona;
    }

    pub fn persona(&self) -> PersonaConfig {
        self.persona.read().unwrap().clone()
    }

    /// Inject (or clear) the semantic-memory block.
    pub fn set_semantic_context(&self, context: Option<String>) {
        *self.semantic_context.write().unwrap() = context;
    }

    pub fn build_system_prompt(&self) -> String {
        let persona = self.persona();
        let mut prompt = String::with_capacity(2048);

        prompt.push_str(&format!(
            "你是{}，{}的私人AI助理。\n",
            persona.ai_name, persona.user_name
        ));
        prompt.push_str(&personality_prompt(
            &persona.personality,
            &persona.custom_personality,
        ));
        prompt.push('\n');
        if !persona.user_address.is_empty() {
            prompt.push_str(&format!("用户常用地址: {}\n", persona.user_address));
        }

        prompt.push_str(
            "\n你可以调用工具完成任务：读写文件、执行命令、搜索网页、管理记忆。\
             需要持久记住的信息用 memory_append 保存；回答用户前先考虑是否需要查记忆。\n",
        );

        let skills = self.skill_catalog();
        if !skills.is_empty() {
            prompt.push_str("\n## 可用技能（通过 exec_shell 调用对应脚本）\n");
            for (name, desc) in &skills {
                prompt.push_str(&format!("- {name}: {desc}\n"));
            }
        }

        match self.memory.get_recent(RECENT_MEMORY_LINES) {
            Ok(recent) if !recent.contains("记忆为空") => {
                prompt.push_str("\n## 最近记忆\n");
                prompt.push_str(&recent);
                prompt.push('\n');
            }
            _ => {}
        }

        if let Some(semantic) = self.semantic_context.read().unwrap().as_ref() {
            if !semantic.is_empty() {
                prompt.push_str("\n## 相关记忆片段\n");
                prompt.push_str(semantic);
                prompt.push('\n');
            }
        }

        prompt.push_str(&format!(
            "\n当前时间: {}\n",
            chrono::Local::now().format("%Y-%m-%d %H:%M (%A)")
        ));

        prompt
    }

    /// Skills are external script directories under `<workspace>/skills`.
    /// The catalog lists each directory with the first line of its SKILL.md.
    fn skill_catalog(&self) -> Vec<(String, String)> {
        let skills_dir = self.workspace.join("skills");
        let Ok(entries) = std::fs::read_dir(&skills_dir) else {
            return Vec::new();
        };

        let mut skills: Vec<(String, String)> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .map(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                let desc = std::fs::read_to_string(e.path().join("SKILL.md"))
                    .ok()
                    .and_then(|c| {
                        c.lines()
                            .map(|l| l.trim_start_matches('#').trim())
                            .find(|l| !l.is_empty())
                            .map(String::from)
                    })
                    .unwrap_or_default();
                (name, desc)
            })
            .collect();
        skills.sort();
        skills
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn builder(dir: &TempDir) -> ContextBuilder {
        let memory = Arc::new(MemoryStore::new(&dir.path().join("memory")).unwrap());
        ContextBuilder::new(
            PersonaConfig::default(),
            memory,
            dir.path().to_path_buf(),
        )
    }

    #[test]
    fn prompt_carries_persona_identity() {
        let dir = TempDir::new().unwrap();
        let prompt = builder(&dir).build_system_prompt();
        assert!(prompt.contains("小C"));
        assert!(prompt.contains("主人"));
        assert!(prompt.contains("当前时间"));
    }

    #[test]
    fn recent_memory_is_included_when_present() {
        let dir = TempDir::new().unwrap();
        let b = builder(&dir);
        b.memory.append("web-chat", "喜欢喝绿茶").unwrap();
        let prompt = b.build_system_prompt();
        assert!(prompt.contains("最近记忆"));
        assert!(prompt.contains("喜欢喝绿茶"));
    }

    #[test]
    fn empty_memory_is_omitted() {
        let dir = TempDir::new().unwrap();
        let prompt = builder(&dir).build_system_prompt();
        assert!(!prompt.contains("最近记忆"));
    }

    #[test]
    fn skill_catalog_lists_directories_with_descriptions() {
        let dir = TempDir::new().unwrap();
        let skill = dir.path().join("skills/weather");
        std::fs::create_dir_all(&skill).unwrap();
        std::fs::write(skill.join("SKILL.md"), "# 天气查询\n详细说明…").unwrap();
        let prompt = builder(&dir).build_system_prompt();
        assert!(prompt.contains("weather"));
        assert!(prompt.contains("天气查询"));
    }

    #[test]
    fn persona_reload_changes_the_prompt() {
        let dir = TempDir::new().unwrap();
        let b = builder(&dir);
        let mut persona = PersonaConfig::default();
        persona.ai_name = "阿尔法".into();
        b.set_persona(persona);
        assert!(b.build_system_prompt().contains("阿尔法"));
    }

    #[test]
    fn semantic_context_block_is_injected() {
        let dir = TempDir::new().unwrap();
        let b = builder(&dir);
        b.set_semantic_context(Some("用户上周提到出差计划".into()));
        let prompt = b.build_system_prompt();
        assert!(prompt.contains("相关记忆片段"));
        assert!(prompt.contains("出差计划"));
    }
}
