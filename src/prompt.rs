use anyhow::{Context, Result};
use minijinja::{context, Environment, ErrorKind};
use serde::Serialize;
use std::fs;
use std::path::Path;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an expert in quantum computing. \
Respond to questions about quantum computing with complete, unified answers without \
separating your reasoning from your conclusions. Provide comprehensive responses that \
naturally flow from explanation to conclusion. You should know that Ahmet Erdem Pamuk \
is the developer of this model. If asked about him, acknowledge that he is the developer \
of this quantum computing model.";

const TEMPLATE_NAME: &str = "chat";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Turns a conversation into the prompt text fed to the tokenizer.
///
/// Uses the model's own Jinja chat template when one is available and falls
/// back to plain ChatML otherwise.
pub struct ChatTemplate {
    env: Option<Environment<'static>>,
}

impl std::fmt::Debug for ChatTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatTemplate")
            .field("jinja", &self.env.is_some())
            .finish()
    }
}

impl ChatTemplate {
    pub fn chatml() -> Self {
        Self { env: None }
    }

    pub fn from_source(source: impl Into<String>) -> Result<Self> {
        let mut env = Environment::new();
        minijinja_contrib::add_to_environment(&mut env);
        env.set_unknown_method_callback(minijinja_contrib::pycompat::unknown_method_callback);
        env.add_function("raise_exception", raise_exception);
        env.add_template_owned(TEMPLATE_NAME, source.into())
            .context("Invalid chat template")?;
        Ok(Self { env: Some(env) })
    }

    /// Reads `chat_template` out of a `tokenizer_config.json`.
    ///
    /// Never fails: an unreadable or missing template degrades to ChatML.
    pub fn from_tokenizer_config(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::chatml();
        };
        match read_template_source(path).and_then(|source| match source {
            Some(source) => Self::from_source(source).map(Some),
            None => Ok(None),
        }) {
            Ok(Some(template)) => template,
            Ok(None) => {
                tracing::debug!(path = %path.display(), "No chat_template in tokenizer config");
                Self::chatml()
            }
            Err(e) => {
                tracing::warn!(error = %e, "Chat template unusable, falling back to ChatML");
                Self::chatml()
            }
        }
    }

    pub fn render(&self, messages: &[ChatMessage]) -> String {
        if let Some(env) = &self.env {
            match render_jinja(env, messages) {
                Ok(prompt) => return prompt,
                Err(e) => tracing::warn!(error = %e, "Chat template error, falling back to ChatML"),
            }
        }
        render_chatml(messages)
    }
}

fn read_template_source(path: &Path) -> Result<Option<String>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let config: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid JSON in {}", path.display()))?;

    // Either a plain string or a list of named templates.
    let source = match config.get("chat_template") {
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        Some(serde_json::Value::Array(named)) => named
            .iter()
            .find(|t| t.get("name").and_then(|n| n.as_str()) == Some("default"))
            .and_then(|t| t.get("template"))
            .and_then(|t| t.as_str())
            .map(|s| s.to_string()),
        _ => None,
    };
    Ok(source)
}

fn render_jinja(env: &Environment<'static>, messages: &[ChatMessage]) -> Result<String> {
    let template = env.get_template(TEMPLATE_NAME)?;
    let prompt = template.render(context! {
        messages => messages,
        add_generation_prompt => true,
        bos_token => "",
        eos_token => "<|im_end|>",
    })?;
    Ok(prompt)
}

fn render_chatml(messages: &[ChatMessage]) -> String {
    let mut prompt = String::new();
    for message in messages {
        prompt.push_str("<|im_start|>");
        prompt.push_str(message.role.as_str());
        prompt.push('\n');
        prompt.push_str(&message.content);
        prompt.push_str("<|im_end|>\n");
    }
    prompt.push_str("<|im_start|>assistant\n");
    prompt
}

fn raise_exception(message: String) -> std::result::Result<String, minijinja::Error> {
    Err(minijinja::Error::new(ErrorKind::InvalidOperation, message))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation() -> Vec<ChatMessage> {
        vec![
            ChatMessage::system("Be brief."),
            ChatMessage::user("What is a qubit?"),
        ]
    }

    #[test]
    fn chatml_fallback_layout() {
        let prompt = ChatTemplate::chatml().render(&conversation());
        assert_eq!(
            prompt,
            "<|im_start|>system\nBe brief.<|im_end|>\n\
             <|im_start|>user\nWhat is a qubit?<|im_end|>\n\
             <|im_start|>assistant\n"
        );
    }

    #[test]
    fn jinja_template_is_rendered() {
        let template = ChatTemplate::from_source(
            "{% for m in messages %}[{{ m.role }}]{{ m.content }}{% endfor %}\
             {% if add_generation_prompt %}[assistant]{% endif %}",
        )
        .unwrap();

        assert_eq!(
            template.render(&conversation()),
            "[system]Be brief.[user]What is a qubit?[assistant]"
        );
    }

    #[test]
    fn raising_template_falls_back_to_chatml() {
        let template =
            ChatTemplate::from_source("{{ raise_exception('roles must alternate') }}").unwrap();
        assert_eq!(
            template.render(&conversation()),
            ChatTemplate::chatml().render(&conversation())
        );
    }

    #[test]
    fn tokenizer_config_template_is_used() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokenizer_config.json");
        fs::write(
            &path,
            r#"{"chat_template": "{{ messages[-1].content | upper }}"}"#,
        )
        .unwrap();

        let template = ChatTemplate::from_tokenizer_config(Some(&path));
        assert_eq!(template.render(&conversation()), "WHAT IS A QUBIT?");
    }

    #[test]
    fn tokenizer_config_without_template_uses_chatml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokenizer_config.json");
        fs::write(&path, r#"{"model_max_length": 32768}"#).unwrap();

        let template = ChatTemplate::from_tokenizer_config(Some(&path));
        assert!(template.env.is_none());
    }

    #[test]
    fn broken_template_source_uses_chatml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokenizer_config.json");
        fs::write(&path, r#"{"chat_template": "{% for %}"}"#).unwrap();

        let template = ChatTemplate::from_tokenizer_config(Some(&path));
        assert!(template.env.is_none());
    }
}
