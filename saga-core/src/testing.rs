//! Test doubles for the completion service.

use crate::completion::{ClientFactory, CompletionRequest, TextCompletion};
use crate::config::CompletionConfig;
use crate::error::{CompletionError, CompletionResult};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

struct Rule {
    needle: String,
    replies: VecDeque<CompletionResult<String>>,
    /// Repeated once `replies` runs dry.
    last: Option<CompletionResult<String>>,
}

#[derive(Default)]
struct Script {
    rules: Vec<Rule>,
    queue: VecDeque<CompletionResult<String>>,
    calls: Vec<CompletionRequest>,
}

/// A completion service that replays scripted replies.
///
/// Rules registered with [`respond_when`](Self::respond_when) match on the
/// system instruction and are checked first, in registration order; a rule
/// repeats its last reply once its queue is drained. Requests no rule matches
/// take the next reply from the FIFO queue. With nothing scripted the call
/// fails with a configuration error.
#[derive(Default)]
pub struct ScriptedCompletion {
    script: Mutex<Script>,
}

impl ScriptedCompletion {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a reply for the next unmatched request.
    pub fn push_reply(&self, text: impl Into<String>) {
        self.lock().queue.push_back(Ok(text.into()));
    }

    /// Queue a failure for the next unmatched request.
    pub fn push_error(&self, error: CompletionError) {
        self.lock().queue.push_back(Err(error));
    }

    /// Reply with `text` whenever the system instruction contains `needle`.
    ///
    /// Calling this again with the same needle queues another reply.
    pub fn respond_when(&self, needle: impl Into<String>, text: impl Into<String>) {
        self.add_rule(needle.into(), Ok(text.into()));
    }

    /// Fail whenever the system instruction contains `needle`.
    pub fn fail_when(&self, needle: impl Into<String>, error: CompletionError) {
        self.add_rule(needle.into(), Err(error));
    }

    fn add_rule(&self, needle: String, reply: CompletionResult<String>) {
        let mut script = self.lock();
        match script.rules.iter_mut().find(|r| r.needle == needle) {
            Some(rule) => rule.replies.push_back(reply),
            None => script.rules.push(Rule {
                needle,
                replies: VecDeque::from([reply]),
                last: None,
            }),
        }
    }

    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    /// Requests whose system instruction contains `needle`.
    pub fn calls_matching(&self, needle: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.system_instruction.contains(needle))
            .count()
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.lock().calls.clone()
    }
}

#[async_trait]
impl TextCompletion for ScriptedCompletion {
    async fn complete(&self, request: &CompletionRequest) -> CompletionResult<String> {
        let mut script = self.lock();
        script.calls.push(request.clone());

        if let Some(rule) = script
            .rules
            .iter_mut()
            .find(|r| request.system_instruction.contains(&r.needle))
        {
            if let Some(reply) = rule.replies.pop_front() {
                rule.last = Some(reply.clone());
                return reply;
            }
            if let Some(reply) = &rule.last {
                return reply.clone();
            }
        }

        script.queue.pop_front().unwrap_or_else(|| {
            Err(CompletionError::Configuration(format!(
                "no scripted reply for: {}",
                request.system_instruction.chars().take(60).collect::<String>()
            )))
        })
    }
}

/// Hands out a shared [`ScriptedCompletion`] regardless of configuration.
#[derive(Clone)]
pub struct ScriptedFactory(pub Arc<ScriptedCompletion>);

impl ClientFactory for ScriptedFactory {
    fn build(&self, _config: &CompletionConfig) -> CompletionResult<Arc<dyn TextCompletion>> {
        Ok(self.0.clone())
    }
}
