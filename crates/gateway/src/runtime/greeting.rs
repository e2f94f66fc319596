//! Greeting fast path.
//!
//! Trivial salutations skip the LLM entirely: a short input matching a fixed
//! keyword set gets a canned reply, chosen deterministically per session so a
//! given conversation keeps a consistent voice.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Inputs longer than this (after trimming punctuation) are never greetings.
const MAX_GREETING_CHARS: usize = 10;

const GREETING_WORDS: &[&str] = &[
    "hello", "hi", "hey", "hiya", "howdy", "yo", "你好", "您好", "嗨", "哈喽", "早上好", "晚上好",
];

/// Canned replies. Every entry mentions "hello" or "你好" so the fast path
/// still reads as a greeting in either language.
const GREETING_POOL: &[&str] = &[
    "Why hello! What can I do for you today?",
    "Well hello! How can I help?",
    "Oh, hello! Nice to hear from you. What do you need?",
    "Well hello there! I'm listening, go ahead.",
    "你好！有什么可以帮你的吗？",
    "你好呀！今天想聊点什么？",
];

/// Whether the input is a trivial greeting.
pub fn is_greeting(input: &str) -> bool {
    let cleaned = normalize(input);
    if cleaned.is_empty() || cleaned.chars().count() > MAX_GREETING_CHARS {
        return false;
    }
    GREETING_WORDS.iter().any(|w| *w == cleaned)
}

/// Pick a canned reply, stable per session.
pub fn canned_reply(session_id: &str) -> &'static str {
    let mut hasher = DefaultHasher::new();
    session_id.hash(&mut hasher);
    GREETING_POOL[(hasher.finish() as usize) % GREETING_POOL.len()]
}

/// Lowercase and strip surrounding whitespace and punctuation (ASCII and the
/// common CJK marks).
fn normalize(input: &str) -> String {
    input
        .trim()
        .trim_matches(|c: char| {
            c.is_ascii_punctuation() || matches!(c, '！' | '？' | '。' | '，' | '、' | '～')
        })
        .trim()
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_plain_greetings() {
        assert!(is_greeting("hello"));
        assert!(is_greeting("  Hi!  "));
        assert!(is_greeting("HEY"));
        assert!(is_greeting("你好"));
        assert!(is_greeting("你好！"));
        assert!(is_greeting("hello!!!"));
    }

    #[test]
    fn rejects_substantive_input() {
        assert!(!is_greeting("hello, what's the weather in Paris?"));
        assert!(!is_greeting("help me write an email"));
        assert!(!is_greeting(""));
        assert!(!is_greeting("   "));
        assert!(!is_greeting("hellooooooooo")); // over the length bound
    }

    #[test]
    fn long_greetings_go_to_the_model() {
        // Over the length bound, so the fast path stays out of the way.
        assert!(!is_greeting("good morning"));
        assert!(!is_greeting("Good Evening!"));
    }

    #[test]
    fn short_cjk_greetings_pass_the_bound() {
        assert!(is_greeting("早上好"));
        assert!(is_greeting("晚上好！"));
    }

    #[test]
    fn reply_is_deterministic_per_session() {
        let a1 = canned_reply("session-a");
        let a2 = canned_reply("session-a");
        assert_eq!(a1, a2);
    }

    #[test]
    fn every_reply_reads_as_a_greeting() {
        for reply in GREETING_POOL {
            assert!(
                reply.contains("hello") || reply.contains("你好"),
                "pool entry {reply:?} lacks a greeting word"
            );
        }
    }
}
