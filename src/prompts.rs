//! Prompt templates
//!
//! Turns are framed with `<|role|>` tags. A root prompt opens a conversation
//! from an empty context; the focus and continuation forms are appended to a
//! restored context, so they never carry a BOS token of their own.

/// Opening prompt for a fresh conversation
pub fn root_prompt(system: &str, user: &str) -> String {
    format!("<|system|>\n{system}\n<|user|>\n{user}\n<|assistant|>\n")
}

/// Branch prompt that anchors a follow-up question on an excerpt
pub fn focus_prompt(system: &str, excerpt: &str, followup: &str) -> String {
    format!(
        "<|system|>\n{system}\n\
         <|context|>\n{excerpt}\n\
         <|user|>\n{followup}\n\
         <|assistant|>\n"
    )
}

/// User turn appended after the assistant's previous reply
pub fn continuation_turn(user: &str) -> String {
    format!("\n<|user|>\n{user}\n<|assistant|>\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_prompt() {
        assert_eq!(
            root_prompt("Be brief.", "What is a monad?"),
            "<|system|>\nBe brief.\n<|user|>\nWhat is a monad?\n<|assistant|>\n"
        );
    }

    #[test]
    fn test_focus_prompt() {
        assert_eq!(
            focus_prompt("sys", "a burrito", "why?"),
            "<|system|>\nsys\n<|context|>\na burrito\n<|user|>\nwhy?\n<|assistant|>\n"
        );
    }

    #[test]
    fn test_continuation_turn_starts_on_new_line() {
        let turn = continuation_turn("and then?");
        assert_eq!(turn, "\n<|user|>\nand then?\n<|assistant|>\n");
        assert!(!turn.contains("<|system|>"));
    }
}
