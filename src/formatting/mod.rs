//! Prompt construction: chat-template framing per model family, and the
//! instruction texts that ask for JSON the response parser understands.

pub mod instructions;
pub mod prompt;

pub use prompt::format_prompt;
