//! Turn content: completion service in generated mode, the next script entry
//! in scripted mode, the announcement on a pair's very first turn.

use matura_core::{
    GenerateError, Identity, Message, Pair, Provider, SchedulingMode, ScriptSource, Speaker, Turn,
    Usage,
};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::GenerationConfig;

/// Content for one turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Generated {
    pub content: String,
    /// Scripted cursor after this turn. `None` leaves the stored cursor alone.
    pub cursor: Option<usize>,
    pub model: Option<String>,
    pub usage: Usage,
}

impl Generated {
    fn plain(content: impl Into<String>, cursor: Option<usize>) -> Self {
        Self {
            content: content.into(),
            cursor,
            model: None,
            usage: Usage::default(),
        }
    }
}

pub(crate) struct ContentGenerator {
    provider: Arc<dyn Provider>,
    scripts: Arc<dyn ScriptSource>,
    config: GenerationConfig,
}

impl std::fmt::Debug for ContentGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentGenerator")
            .field("provider", &self.provider.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ContentGenerator {
    pub(crate) fn new(
        provider: Arc<dyn Provider>,
        scripts: Arc<dyn ScriptSource>,
        config: GenerationConfig,
    ) -> Self {
        Self {
            provider,
            scripts,
            config,
        }
    }

    pub(crate) fn history_limit(&self) -> usize {
        self.config.history_limit
    }

    /// Phrase substituted when generation fails, picked by turn counter.
    pub(crate) fn fallback_phrase(&self, turn_counter: u64) -> String {
        let phrases: Vec<&str> = self
            .config
            .fallback_phrases
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty())
            .collect();
        if phrases.is_empty() {
            return "...".to_owned();
        }
        let len = phrases.len() as u64;
        let idx = usize::try_from(turn_counter % len).unwrap_or(0);
        phrases[idx].to_owned()
    }

    pub(crate) async fn generate(
        &self,
        pair: &Pair,
        speaker: Speaker,
        identity: &Identity,
        history: &[Turn],
    ) -> Result<Generated, GenerateError> {
        if pair.turn_counter == 0
            && let Some(announcement) = self
                .config
                .announcement
                .as_deref()
                .map(str::trim)
                .filter(|a| !a.is_empty())
        {
            debug!(pair.id = %pair.id, "first turn uses announcement");
            return Ok(Generated::plain(announcement, None));
        }

        match &pair.mode {
            SchedulingMode::Scripted {
                script_id,
                cursor,
                looped,
            } => self.next_script_entry(script_id, *cursor, *looped).await,
            SchedulingMode::Generated => self.complete(pair, speaker, identity, history).await,
        }
    }

    async fn next_script_entry(
        &self,
        script_id: &str,
        cursor: usize,
        looped: bool,
    ) -> Result<Generated, GenerateError> {
        let messages = self
            .scripts
            .messages(script_id)
            .await
            .map_err(|e| GenerateError::Failed(format!("{e:#}")))?
            .ok_or_else(|| GenerateError::UnknownScript {
                script_id: script_id.to_owned(),
            })?;

        let exhausted = || GenerateError::ScriptExhausted {
            script_id: script_id.to_owned(),
        };
        if messages.is_empty() {
            return Err(exhausted());
        }

        let index = if cursor < messages.len() {
            cursor
        } else if looped {
            0
        } else {
            return Err(exhausted());
        };

        let mut next = index + 1;
        if looped && next >= messages.len() {
            next = 0;
        }

        Ok(Generated::plain(messages[index].clone(), Some(next)))
    }

    async fn complete(
        &self,
        pair: &Pair,
        speaker: Speaker,
        identity: &Identity,
        history: &[Turn],
    ) -> Result<Generated, GenerateError> {
        let prompt = identity
            .prompt()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| GenerateError::MissingBehavior {
                member: identity.name.clone(),
            })?;

        let speaker_name = pair.member(speaker);
        let messages = history_messages(history, speaker_name, self.config.history_limit);

        let completion = self.provider.complete(prompt, &messages);
        let (message, usage) = match tokio::time::timeout(self.config.timeout(), completion).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(error)) => return Err(GenerateError::Failed(format!("{error:#}"))),
            Err(_elapsed) => {
                warn!(
                    pair.id = %pair.id,
                    timeout_ms = self.config.timeout_ms,
                    "completion timed out"
                );
                return Err(GenerateError::Failed(format!(
                    "completion timed out after {}ms",
                    self.config.timeout_ms
                )));
            }
        };

        let content =
            truncate_reply(&message.content, self.config.max_lines, self.config.max_chars);
        if content.is_empty() {
            return Err(GenerateError::Failed("empty completion".to_owned()));
        }

        Ok(Generated {
            content,
            cursor: None,
            model: Some(self.provider.model_info().name.clone()),
            usage,
        })
    }
}

/// The tail of `history` seen from `speaker`: their own turns are assistant
/// messages, the partner's are user messages.
pub(crate) fn history_messages(history: &[Turn], speaker: &str, limit: usize) -> Vec<Message> {
    let skip = history.len().saturating_sub(limit);
    history[skip..]
        .iter()
        .map(|turn| {
            if turn.from_member == speaker {
                Message::assistant(turn.content.clone())
            } else {
                Message::user(turn.content.clone())
            }
        })
        .collect()
}

/// Keep the first `max_lines` non-blank lines and at most `max_chars`
/// characters, trimmed.
pub(crate) fn truncate_reply(text: &str, max_lines: usize, max_chars: usize) -> String {
    let joined = text
        .trim()
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .take(max_lines)
        .collect::<Vec<_>>()
        .join("\n");

    let cut = match joined.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &joined[..byte_idx],
        None => joined.as_str(),
    };
    cut.trim().to_owned()
}
