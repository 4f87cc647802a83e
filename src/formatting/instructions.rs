use crate::language::{ExerciseKind, Language};

const EXERCISE_SCHEMA: &str = r#"Format the response as JSON:
{
  "sentence": "sentence in target language",
  "translation": "Translation in native language",
  "words": ["word1", "word2", ...],
  "translations": ["translation1", "translation2", ...]
}"#;

const FEEDBACK_SCHEMA: &str = r#"Provide a detailed evaluation in JSON format:
{
  "isCorrect": true/false,
  "score": 0.0-1.0,
  "feedback": "Detailed feedback",
  "suggestions": ["suggestion1", "suggestion2"],
  "grammarErrors": ["error1", "error2"],
  "vocabularyErrors": ["error1", "error2"]
}"#;

/// Style guidance for sentences in `language`.
pub fn language_instruction(language: Language) -> String {
    let everyday = |name: &str| {
        format!(
            "Target language: {}. Use simple, everyday {} suitable for beginners.",
            name, name
        )
    };
    match language {
        Language::Japanese => "Target language: Japanese. Use hiragana for beginners, \
                               with kanji in parentheses when appropriate."
            .to_string(),
        Language::Chinese => {
            "Target language: Chinese. Use simplified characters with pinyin.".to_string()
        }
        Language::Finnish => everyday("Finnish"),
        Language::Spanish => everyday("Spanish"),
        Language::French => everyday("French"),
        Language::German => everyday("German"),
        Language::Italian => everyday("Italian"),
        Language::Russian => everyday("Russian"),
        Language::Korean => everyday("Korean"),
        other => format!(
            "Target language: {}. Use simple, everyday language suitable for beginners.",
            other.display_name()
        ),
    }
}

fn header(kind: ExerciseKind, target: Language, native: Language) -> String {
    format!(
        "Problem type: {}\nTarget language: {}\nNative language: {}",
        kind.display_name(),
        target.display_name(),
        native.display_name()
    )
}

fn deliverables(target: Language, native: Language, first: &str) -> String {
    format!(
        "1. {first} in {t}\n2. Translation in {n}\n3. Individual words from the sentence\n\
         4. Translations for each word in {n}",
        first = first,
        t = target.display_name(),
        n = native.display_name()
    )
}

/// Asks for an exercise describing the attached image.
pub fn image_exercise(kind: ExerciseKind, target: Language, native: Language) -> String {
    format!(
        "Please analyze this image and create a language learning exercise.\n\n{}\n\n\
         Create a language learning exercise based on this image.\n\n{}\n\n\
         Create a sentence that describes what's in the image, and provide:\n{}\n\n{}",
        language_instruction(target),
        header(kind, target, native),
        deliverables(target, native, "The sentence"),
        EXERCISE_SCHEMA
    )
}

/// Asks for a self-contained beginner exercise with no image.
pub fn text_exercise(kind: ExerciseKind, target: Language, native: Language) -> String {
    format!(
        "Create a simple language learning exercise.\n\n{}\n\n{}\n\nProvide:\n{}\n\n{}",
        language_instruction(target),
        header(kind, target, native),
        deliverables(target, native, "A simple sentence"),
        EXERCISE_SCHEMA
    )
}

/// Asks for an exercise built around `source`, e.g. a shared caption or
/// a sentence the learner typed.
pub fn source_text_exercise(
    kind: ExerciseKind,
    target: Language,
    native: Language,
    source: &str,
    with_image: bool,
) -> String {
    let subject = if with_image {
        "this image and the text below"
    } else {
        "the text below"
    };
    format!(
        "Create a language learning exercise based on {}.\n\nText:\n{}\n\n{}\n\n{}\n\n\
         Write one sentence about the text, and provide:\n{}\n\n{}",
        subject,
        source,
        language_instruction(target),
        header(kind, target, native),
        deliverables(target, native, "The sentence"),
        EXERCISE_SCHEMA
    )
}

/// Asks the model to grade `user_answer` against `correct_answer`.
pub fn evaluation(
    kind: ExerciseKind,
    language: Language,
    user_answer: &str,
    correct_answer: &str,
) -> String {
    format!(
        "Please evaluate this language learning answer.\n\nProblem type: {}\nLanguage: {}\n\
         Correct answer: {}\nUser answer: {}\n\n{}",
        kind.display_name(),
        language.display_name(),
        correct_answer,
        user_answer,
        FEEDBACK_SCHEMA
    )
}
