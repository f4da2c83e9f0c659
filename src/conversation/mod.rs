//! Prompt assembly and post-processing for the persona model.

pub const BOS_TOKEN: &str = "<|startoftext|>";
pub const EOS_TOKEN: &str = "<|endoftext|>";
pub const PAD_TOKEN: &str = "<|pad|>";

/// Characters that count as a finished reply when they end the text.
pub const END_MARKERS: &[char] = &['.', '!', '?', '\n'];

/// Characters searched for when the reply has to be cut back.
/// Newline is intentionally absent here.
const SENTENCE_ENDS: &[char] = &['.', '!', '?'];

/// Wraps the user text the way the persona checkpoint was fine-tuned:
/// `<|startoftext|><persona>user text`.
pub fn build_persona_prompt(user_prompt: &str, persona_token: &str) -> String {
    let mut prompt = String::with_capacity(BOS_TOKEN.len() + persona_token.len() + user_prompt.len());
    prompt.push_str(BOS_TOKEN);
    prompt.push_str(persona_token);
    prompt.push_str(user_prompt);
    prompt
}

/// Cuts a generated reply back to its last complete sentence.
///
/// Text already ending in one of [`END_MARKERS`] is returned as is. Otherwise
/// everything after the rightmost `.`, `!` or `?` is dropped, and when there
/// is none at all an ellipsis is appended.
pub fn trim_to_sentence(text: &str) -> String {
    if text.ends_with(END_MARKERS) {
        return text.to_string();
    }

    match text.rfind(SENTENCE_ENDS) {
        // all markers are single-byte, so `idx + 1` is a char boundary
        Some(idx) => text[..=idx].to_string(),
        None => format!("{text}..."),
    }
}
