//! Prompt heuristic for deciding that a shell command has finished.
//!
//! There is no delimiter in an interactive shell stream that reliably marks
//! the end of a command. We look at the tail of the decoded output, with
//! terminal control sequences removed, and check whether it ends with
//! something that looks like a shell prompt. Output that happens to end in
//! the prompt pattern will be mistaken for completion, and programs that
//! never print a prompt again will always run into the timeout.

use once_cell::sync::Lazy;
use regex::Regex;

/// CSI escape sequences (colours, cursor movement, bracketed paste toggles).
static ANSI_CSI: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\x1B\[[0-?]*[ -/]*[@-~]").expect("valid ANSI pattern"));

/// Typical bash/zsh prompt terminator.
pub const DEFAULT_PROMPT_PATTERN: &str = r"[$#] ";

/// Only the last characters of the buffer are inspected.
const TAIL_CHARS: usize = 1024;

/// Remove CSI escape sequences from terminal output.
pub fn strip_ansi(text: &str) -> String {
    ANSI_CSI.replace_all(text, "").into_owned()
}

/// Trailing-prompt matcher.
#[derive(Debug, Clone)]
pub struct PromptDetector {
    trailing: Regex,
}

impl PromptDetector {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let trailing = Regex::new(&format!(r"(?:{pattern})\s*$"))?;
        Ok(Self { trailing })
    }

    /// True when the accumulated output ends with a prompt.
    pub fn is_complete(&self, buffer: &str) -> bool {
        if buffer.is_empty() {
            return false;
        }
        let cleaned = strip_ansi(buffer).replace('\r', "");
        let tail = tail_chars(&cleaned, TAIL_CHARS);
        self.trailing.is_match(tail)
    }
}

impl Default for PromptDetector {
    fn default() -> Self {
        Self {
            trailing: Regex::new(r"(?:[$#] )\s*$").expect("valid default prompt pattern"),
        }
    }
}

fn tail_chars(text: &str, max: usize) -> &str {
    let count = text.chars().count();
    if count <= max {
        return text;
    }
    match text.char_indices().nth(count - max) {
        Some((idx, _)) => &text[idx..],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detects_plain_prompt() {
        let detector = PromptDetector::default();
        assert!(detector.is_complete("ls\r\nfile.txt\r\nuser@robot:~$ "));
        assert!(detector.is_complete("root@robot:/# "));
    }

    #[test]
    fn test_ignores_output_without_prompt() {
        let detector = PromptDetector::default();
        assert!(!detector.is_complete(""));
        assert!(!detector.is_complete("still running...\r\n"));
        assert!(!detector.is_complete("cost: 5$"));
    }

    #[test]
    fn test_strips_colour_codes_before_matching() {
        let detector = PromptDetector::default();
        let coloured = "done\r\n\x1b[01;32muser@robot\x1b[00m:\x1b[01;34m~\x1b[00m$ \x1b[?2004h";
        assert!(detector.is_complete(coloured));
    }

    #[test]
    fn test_custom_pattern() {
        let detector = PromptDetector::new(r">>> ").unwrap();
        assert!(detector.is_complete("Python 3\n>>> "));
        assert!(!detector.is_complete("user@robot:~$ "));
    }

    #[test]
    fn test_only_tail_is_inspected() {
        let detector = PromptDetector::default();
        let mut buffer = String::from("$ ");
        buffer.push_str(&"x".repeat(4096));
        assert!(!detector.is_complete(&buffer));
        buffer.push_str("\n$ ");
        assert!(detector.is_complete(&buffer));
    }

    #[test]
    fn test_strip_ansi() {
        assert_eq!(strip_ansi("\x1b[31mred\x1b[0m"), "red");
    }
}
