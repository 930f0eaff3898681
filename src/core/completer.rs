//! Tab completion providers

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompletionError {
    #[error("completion provider failed: {0}")]
    Provider(String),

    #[error("completion provider panicked: {0}")]
    Panicked(String),
}

/// Result of completing the text before the cursor
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Completion {
    /// Replacement for the whole pre-cursor text
    pub completed: String,
    /// Candidates to list when no progress could be made
    pub candidates: Vec<String>,
}

/// Maps the pre-cursor text to a completion
pub trait CompletionProvider: Send + Sync {
    fn complete(&self, incomplete: &str) -> Result<Completion, CompletionError>;
}

impl<F> CompletionProvider for F
where
    F: Fn(&str) -> Result<Completion, CompletionError> + Send + Sync,
{
    fn complete(&self, incomplete: &str) -> Result<Completion, CompletionError> {
        self(incomplete)
    }
}

/// Completes the last whitespace-separated token against a fixed word list.
pub struct WordCompleter {
    words: Vec<String>,
}

impl WordCompleter {
    pub fn new<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut words: Vec<String> = words.into_iter().map(Into::into).collect();
        words.sort();
        words.dedup();
        Self { words }
    }
}

impl CompletionProvider for WordCompleter {
    fn complete(&self, incomplete: &str) -> Result<Completion, CompletionError> {
        let token_start = incomplete
            .rfind(char::is_whitespace)
            .map(|idx| idx + incomplete[idx..].chars().next().map_or(1, char::len_utf8))
            .unwrap_or(0);
        let (head, token) = incomplete.split_at(token_start);

        let matches: Vec<&String> = self.words.iter().filter(|w| w.starts_with(token)).collect();

        let completed = match matches.as_slice() {
            [] => incomplete.to_string(),
            [only] => format!("{}{} ", head, only),
            several => format!("{}{}", head, common_prefix(several)),
        };

        let candidates = if matches.len() > 1 && completed == incomplete {
            matches.into_iter().cloned().collect()
        } else {
            Vec::new()
        };

        Ok(Completion {
            completed,
            candidates,
        })
    }
}

fn common_prefix(words: &[&String]) -> String {
    let Some(first) = words.first() else {
        return String::new();
    };
    let mut end = first.len();
    for word in &words[1..] {
        end = first
            .char_indices()
            .zip(word.chars())
            .take_while(|((_, a), b)| a == b)
            .map(|((i, a), _)| i + a.len_utf8())
            .last()
            .unwrap_or(0)
            .min(end);
    }
    first[..end].to_string()
}

/// Chooses the provider for a tab press.
///
/// While a worker owns standard input the external handler (if any) is used,
/// otherwise the idle completer.
#[derive(Default)]
pub struct TabHandlers {
    idle: Mutex<Option<Arc<dyn CompletionProvider>>>,
    external: Mutex<Option<Arc<dyn CompletionProvider>>>,
    input_claimed: AtomicBool,
}

impl TabHandlers {
    pub fn new(idle: Option<Arc<dyn CompletionProvider>>) -> Self {
        Self {
            idle: Mutex::new(idle),
            external: Mutex::new(None),
            input_claimed: AtomicBool::new(false),
        }
    }

    pub fn set_idle(&self, handler: Option<Arc<dyn CompletionProvider>>) {
        *self.idle.lock().unwrap_or_else(|p| p.into_inner()) = handler;
    }

    pub fn set_external(&self, handler: Option<Arc<dyn CompletionProvider>>) {
        *self.external.lock().unwrap_or_else(|p| p.into_inner()) = handler;
    }

    /// Mark whether a running worker owns standard input
    pub fn claim_input(&self, claimed: bool) {
        self.input_claimed.store(claimed, Ordering::SeqCst);
    }

    pub fn input_claimed(&self) -> bool {
        self.input_claimed.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> Option<Arc<dyn CompletionProvider>> {
        let slot = if self.input_claimed() {
            &self.external
        } else {
            &self.idle
        };
        slot.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completer() -> WordCompleter {
        WordCompleter::new(["echo", "exit", "cat", "clear", "color"])
    }

    #[test]
    fn test_single_match_completes_with_space() {
        let c = completer().complete("ca").unwrap();
        assert_eq!(c.completed, "cat ");
        assert!(c.candidates.is_empty());
    }

    #[test]
    fn test_common_prefix_extends() {
        let c = completer().complete("cl").unwrap();
        assert_eq!(c.completed, "clear ");

        let c = completer().complete("echo c").unwrap();
        assert_eq!(c.completed, "echo c");
        assert_eq!(c.candidates, vec!["cat", "clear", "color"]);
    }

    #[test]
    fn test_ambiguous_prefix_lists_candidates() {
        let c = completer().complete("e").unwrap();
        assert_eq!(c.completed, "e");
        assert_eq!(c.candidates, vec!["echo", "exit"]);
    }

    #[test]
    fn test_partial_common_prefix() {
        let c = WordCompleter::new(["upper", "uptime"]).complete("u").unwrap();
        assert_eq!(c.completed, "up");
        assert!(c.candidates.is_empty());
    }

    #[test]
    fn test_no_match_leaves_text() {
        let c = completer().complete("zz").unwrap();
        assert_eq!(c.completed, "zz");
        assert!(c.candidates.is_empty());
    }

    #[test]
    fn test_active_handler_follows_input_claim() {
        let handlers = TabHandlers::new(Some(Arc::new(completer())));
        assert!(handlers.active().is_some());

        handlers.claim_input(true);
        assert!(handlers.active().is_none());

        let external = |s: &str| {
            Ok(Completion {
                completed: format!("{}!", s),
                candidates: Vec::new(),
            })
        };
        handlers.set_external(Some(Arc::new(external)));
        let active = handlers.active().unwrap();
        assert_eq!(active.complete("x").unwrap().completed, "x!");
    }
}
