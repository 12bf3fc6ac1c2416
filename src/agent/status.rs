//! Heuristic status classification
//!
//! Maps the trailing output of a session plus a few timing signals to a
//! coarse activity state. Rules are evaluated top to bottom and the first
//! match wins; when nothing matches the session is idle.
//!
//! This reads unstructured terminal text. It is deterministic, not exact.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::warn;

use crate::config::StatusThresholds;

/// Coarse activity state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Spawned, no output yet
    Starting,
    /// Streaming output
    Running,
    /// Showing a question, menu or prompt
    WaitingInput,
    /// Running a tool or command
    ToolCalling,
    /// Live but quiet
    Idle,
    /// No live process
    Disconnected,
    /// The process could not be driven
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Starting => "starting",
            SessionStatus::Running => "running",
            SessionStatus::WaitingInput => "waiting_input",
            SessionStatus::ToolCalling => "tool_calling",
            SessionStatus::Idle => "idle",
            SessionStatus::Disconnected => "disconnected",
            SessionStatus::Error => "error",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the classifier looks at. Durations are measured by the caller
/// against one clock reading; `None` means "never happened".
#[derive(Debug, Clone, Copy)]
pub struct StatusInput<'a> {
    /// Trailing output text
    pub text: &'a str,
    pub since_output: Option<Duration>,
    pub since_input: Option<Duration>,
    /// Bytes produced within the recent window
    pub recent_output_size: usize,
    pub has_process: bool,
    pub is_restored: bool,
}

/// Normalized view of a [`StatusInput`] that rules are evaluated against
#[derive(Debug, Clone)]
pub struct Observation {
    /// Trailing window with escape sequences removed
    pub window: String,
    /// Shorter tail used for shell-prompt detection
    pub prompt_tail: String,
    pub since_output: Option<Duration>,
    pub since_input: Option<Duration>,
    pub recent_output_size: usize,
    pub live: bool,
}

type Predicate = Box<dyn Fn(&Observation) -> bool + Send + Sync>;

/// One step of the cascade
pub struct Rule {
    name: &'static str,
    status: SessionStatus,
    predicate: Predicate,
}

impl Rule {
    fn new(
        name: &'static str,
        status: SessionStatus,
        predicate: impl Fn(&Observation) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name,
            status,
            predicate: Box::new(predicate),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn matches(&self, observation: &Observation) -> bool {
        (self.predicate)(observation)
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("status", &self.status)
            .finish()
    }
}

/// Questions, menus and permission prompts
const QUESTION_PATTERNS: &[&str] = &[
    r"○",
    r"(?i)●.*\d+\s+questions",
    r"(?i)What brings you to",
    r"(?i)Enter to select.*Tab.*Arrow.*Esc",
    r"\[.*\]\s*\?",
    r"\d+\.\s+[A-Z][^.]+\?",
    r"(?i)please select",
    r"(?i)choose an option",
    r"(?i)which.*would you like",
    r"(?i)what would you like",
    r"(?i)how can i help",
    r"(?i)what can i do",
    r"(?i)select.*option",
    r"(?i)type.*message",
    r"(?i)waiting.*input",
    r"(?i)press.*enter",
    r"(?i)Do you want to allow",
    r"\d+\.\s+Yes",
    r"(?i)\(esc\)",
    r"(?i)don't ask again",
    r"(?i)tell Claude what to do",
];

/// Literal confirmations, matched case-insensitively
const CONFIRMATION_LITERALS: &[&str] = &[
    "(y/n)",
    "[y/n]",
    "[yes/no]",
    "continue?",
    "proceed?",
    "confirm?",
];

/// Shell-prompt-like endings
const PROMPT_PATTERNS: &[&str] = &[r"[>$%#❯λ]\s*$", r"\]\s*$"];

/// Named file/command operations and execution markers
const TOOL_PATTERNS: &[&str] = &[
    r"(?i)→\s+(Read|Write|Edit|Bash|Grep|Glob|Task|WebFetch|WebSearch)",
    r"⏺\s*(Read|Write|Update|Edit|Bash|Grep|Glob|Task|WebFetch|WebSearch)\(",
    r"(?i)using the (read|write|edit|bash|grep|glob|task|file)",
    r"(?i)calling.*tool",
    r"(?i)executing.*command",
    r"(?i)running.*command",
    r"(?i)\[tool:\s*\w+\]",
    r"(?i)\[executing\]",
    r"(?i)\[running\]",
    r"(?i)reading.*file",
    r"(?i)writing.*file",
    r"(?i)editing.*file",
    r"(?i)searching.*file",
];

/// CSI and OSC escape sequences
const ANSI_PATTERN: &str = r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(\x07|\x1b\\)|\x1b[()][A-Za-z0-9]|\x1b[=>]";

fn compile<S: AsRef<str>>(patterns: &[S]) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|pattern| match Regex::new(pattern.as_ref()) {
            Ok(re) => Some(re),
            Err(e) => {
                warn!("Skipping status pattern {:?}: {}", pattern.as_ref(), e);
                None
            }
        })
        .collect()
}

fn tail_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().rev().nth(max_chars.saturating_sub(1)) {
        Some((idx, _)) if max_chars > 0 => &text[idx..],
        _ if max_chars == 0 => "",
        _ => text,
    }
}

fn within(since: Option<Duration>, limit: Duration) -> bool {
    since.is_some_and(|d| d < limit)
}

/// Ordered rule cascade for classifying session output
pub struct StatusDetector {
    rules: Vec<Rule>,
    ansi: Option<Regex>,
    window_chars: usize,
    prompt_window_chars: usize,
}

impl StatusDetector {
    /// Build the cascade with the given thresholds
    pub fn new(thresholds: &StatusThresholds) -> Self {
        let questions = compile(QUESTION_PATTERNS);
        let confirmations = compile(
            &CONFIRMATION_LITERALS
                .iter()
                .map(|literal| format!("(?i){}", regex::escape(literal)))
                .collect::<Vec<_>>(),
        );
        let prompts = compile(PROMPT_PATTERNS);
        let tools = compile(TOOL_PATTERNS);

        let tool_recency = thresholds.tool_recency();
        let burst_recency = thresholds.burst_recency();
        let burst_min = thresholds.burst_min_bytes;
        let stream_recency = thresholds.stream_recency();
        let stream_min = thresholds.stream_min_bytes;
        let typing = thresholds.typing_suppression();

        let rules = vec![
            Rule::new("no_process", SessionStatus::Disconnected, |o| !o.live),
            Rule::new("question_prompt", SessionStatus::WaitingInput, move |o| {
                questions.iter().any(|re| re.is_match(&o.window))
            }),
            Rule::new("confirmation", SessionStatus::WaitingInput, move |o| {
                confirmations.iter().any(|re| re.is_match(&o.window))
            }),
            Rule::new("shell_prompt", SessionStatus::WaitingInput, move |o| {
                prompts.iter().any(|re| re.is_match(&o.prompt_tail))
            }),
            Rule::new("tool_call", SessionStatus::ToolCalling, move |o| {
                within(o.since_output, tool_recency) && tools.iter().any(|re| re.is_match(&o.window))
            }),
            Rule::new("output_burst", SessionStatus::Running, move |o| {
                within(o.since_output, burst_recency)
                    && o.recent_output_size > burst_min
                    && !within(o.since_input, typing)
            }),
            Rule::new("output_stream", SessionStatus::Running, move |o| {
                within(o.since_output, stream_recency)
                    && o.recent_output_size > stream_min
                    && !within(o.since_input, typing)
            }),
        ];

        Self {
            rules,
            ansi: Regex::new(ANSI_PATTERN).ok(),
            window_chars: thresholds.window_chars,
            prompt_window_chars: thresholds.prompt_window_chars,
        }
    }

    /// The cascade in evaluation order
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Normalize raw input for rule evaluation
    pub fn observe(&self, input: &StatusInput<'_>) -> Observation {
        let cleaned = match &self.ansi {
            Some(re) => re.replace_all(input.text, ""),
            None => input.text.into(),
        };
        let window = tail_chars(&cleaned, self.window_chars);
        let prompt_tail = tail_chars(window, self.prompt_window_chars);

        Observation {
            window: window.to_string(),
            prompt_tail: prompt_tail.to_string(),
            since_output: input.since_output,
            since_input: input.since_input,
            recent_output_size: input.recent_output_size,
            live: input.has_process && !input.is_restored,
        }
    }

    /// First rule matching the input, if any
    pub fn matching_rule(&self, input: &StatusInput<'_>) -> Option<&Rule> {
        let observation = self.observe(input);
        self.rules.iter().find(|rule| rule.matches(&observation))
    }

    /// Classify a session. Falls back to idle.
    pub fn classify(&self, input: &StatusInput<'_>) -> SessionStatus {
        self.matching_rule(input)
            .map(Rule::status)
            .unwrap_or(SessionStatus::Idle)
    }
}

impl Default for StatusDetector {
    fn default() -> Self {
        Self::new(&StatusThresholds::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(millis: u64) -> Option<Duration> {
        Some(Duration::from_millis(millis))
    }

    fn live(text: &str) -> StatusInput<'_> {
        StatusInput {
            text,
            since_output: ms(100),
            since_input: None,
            recent_output_size: 0,
            has_process: true,
            is_restored: false,
        }
    }

    #[test]
    fn test_rule_order() {
        let detector = StatusDetector::default();
        let names: Vec<_> = detector.rules().iter().map(Rule::name).collect();
        assert_eq!(
            names,
            vec![
                "no_process",
                "question_prompt",
                "confirmation",
                "shell_prompt",
                "tool_call",
                "output_burst",
                "output_stream",
            ]
        );
    }

    #[test]
    fn test_yes_no_confirmation_waits_for_input() {
        let detector = StatusDetector::default();
        let input = StatusInput {
            since_output: ms(1500),
            ..live("Overwrite existing file. Continue? (y/n)")
        };
        assert_eq!(detector.classify(&input), SessionStatus::WaitingInput);
    }

    #[test]
    fn test_streaming_output_is_running() {
        let detector = StatusDetector::default();
        let input = StatusInput {
            since_output: ms(300),
            since_input: ms(5000),
            recent_output_size: 80,
            ..live("Compiling serde v1.0.200\nCompiling tokio v1.38.0")
        };
        assert_eq!(detector.classify(&input), SessionStatus::Running);
    }

    #[test]
    fn test_recent_typing_suppresses_running() {
        let detector = StatusDetector::default();
        let input = StatusInput {
            since_output: ms(300),
            since_input: ms(200),
            recent_output_size: 500,
            ..live("Compiling serde v1.0.200")
        };
        assert_eq!(detector.classify(&input), SessionStatus::Idle);
    }

    #[test]
    fn test_sustained_stream_needs_more_volume() {
        let detector = StatusDetector::default();
        let text = "Compiling serde v1.0.200";

        let input = StatusInput {
            since_output: ms(1500),
            recent_output_size: 80,
            ..live(text)
        };
        assert_eq!(detector.classify(&input), SessionStatus::Idle);

        let input = StatusInput {
            since_output: ms(1500),
            recent_output_size: 150,
            ..live(text)
        };
        assert_eq!(detector.classify(&input), SessionStatus::Running);
    }

    #[test]
    fn test_no_process_is_disconnected() {
        let detector = StatusDetector::default();

        let input = StatusInput {
            has_process: false,
            ..live("Continue? (y/n)")
        };
        assert_eq!(detector.classify(&input), SessionStatus::Disconnected);

        let input = StatusInput {
            is_restored: true,
            recent_output_size: 1000,
            ..live("→ Read src/main.rs")
        };
        assert_eq!(detector.classify(&input), SessionStatus::Disconnected);
    }

    #[test]
    fn test_tool_call_requires_recent_output() {
        let detector = StatusDetector::default();

        let input = StatusInput {
            since_output: ms(1000),
            ..live("→ Read src/main.rs")
        };
        assert_eq!(detector.classify(&input), SessionStatus::ToolCalling);

        let input = StatusInput {
            since_output: ms(5000),
            ..live("→ Read src/main.rs")
        };
        assert_eq!(detector.classify(&input), SessionStatus::Idle);

        let input = StatusInput {
            since_output: None,
            ..live("→ Read src/main.rs")
        };
        assert_eq!(detector.classify(&input), SessionStatus::Idle);
    }

    #[test]
    fn test_prompt_beats_tool_marker() {
        let detector = StatusDetector::default();
        let input = live("⏺ Bash(rm -rf target)\nDo you want to allow this command?");
        let rule = detector.matching_rule(&input).unwrap();
        assert_eq!(rule.name(), "question_prompt");
        assert_eq!(detector.classify(&input), SessionStatus::WaitingInput);
    }

    #[test]
    fn test_shell_prompt_ending() {
        let detector = StatusDetector::default();
        let input = live("total 0\nuser@host:~/project$ ");
        let rule = detector.matching_rule(&input).unwrap();
        assert_eq!(rule.name(), "shell_prompt");
    }

    #[test]
    fn test_escape_sequences_are_ignored() {
        let detector = StatusDetector::default();

        let input = live("\x1b[1;32mProceed?\x1b[0m");
        assert_eq!(detector.classify(&input), SessionStatus::WaitingInput);

        let input = live("\x1b]0;title\x07user@host:~$ \x1b[0m\x1b[?25h");
        assert_eq!(detector.classify(&input), SessionStatus::WaitingInput);
    }

    #[test]
    fn test_only_trailing_window_is_inspected() {
        let detector = StatusDetector::default();
        let text = format!("Continue? (y/n)\n{}", "x".repeat(3100));
        assert_eq!(detector.classify(&live(&text)), SessionStatus::Idle);

        let text = format!("{}\nContinue? (y/n)", "x".repeat(3100));
        assert_eq!(detector.classify(&live(&text)), SessionStatus::WaitingInput);
    }

    #[test]
    fn test_window_respects_char_boundaries() {
        let detector = StatusDetector::new(&StatusThresholds {
            window_chars: 3,
            prompt_window_chars: 2,
            ..Default::default()
        });
        let observation = detector.observe(&live("ééé❯λ"));
        assert_eq!(observation.window, "é❯λ");
        assert_eq!(observation.prompt_tail, "❯λ");
    }

    #[test]
    fn test_classify_is_deterministic() {
        let detector = StatusDetector::default();
        let input = StatusInput {
            since_output: ms(700),
            since_input: ms(3000),
            recent_output_size: 120,
            ..live("Thinking about the refactor")
        };
        let first = detector.classify(&input);
        for _ in 0..10 {
            assert_eq!(detector.classify(&input), first);
        }
        assert_eq!(first, SessionStatus::Running);
    }

    #[test]
    fn test_pathological_input_does_not_fail() {
        let detector = StatusDetector::default();
        let text = "[".repeat(100_000);
        assert_eq!(detector.classify(&live(&text)), SessionStatus::Idle);

        assert_eq!(detector.classify(&live("")), SessionStatus::Idle);
        assert_eq!(detector.classify(&live("\x1b\x1b[[[\x1b")), SessionStatus::Idle);
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&SessionStatus::WaitingInput).unwrap();
        assert_eq!(json, "\"waiting_input\"");
        assert_eq!(SessionStatus::ToolCalling.to_string(), "tool_calling");
    }
}
