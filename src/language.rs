use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Languages a learner can study or use as their native language.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Language {
    #[serde(rename = "ja")]
    Japanese,
    #[serde(rename = "en")]
    English,
    #[serde(rename = "fi")]
    Finnish,
    #[serde(rename = "ru")]
    Russian,
    #[serde(rename = "es")]
    Spanish,
    #[serde(rename = "fr")]
    French,
    #[serde(rename = "it")]
    Italian,
    #[serde(rename = "ko")]
    Korean,
    #[serde(rename = "zh")]
    Chinese,
    #[serde(rename = "de")]
    German,
    #[serde(rename = "ky")]
    Kyrgyz,
    #[serde(rename = "kk")]
    Kazakh,
    #[serde(rename = "bg")]
    Bulgarian,
    #[serde(rename = "be")]
    Belarusian,
    #[serde(rename = "hy")]
    Armenian,
    #[serde(rename = "ar")]
    Arabic,
    #[serde(rename = "hi")]
    Hindi,
    #[serde(rename = "el")]
    Greek,
    #[serde(rename = "ga")]
    Irish,
}

impl Language {
    pub const ALL: [Language; 19] = [
        Language::Japanese,
        Language::English,
        Language::Finnish,
        Language::Russian,
        Language::Spanish,
        Language::French,
        Language::Italian,
        Language::Korean,
        Language::Chinese,
        Language::German,
        Language::Kyrgyz,
        Language::Kazakh,
        Language::Bulgarian,
        Language::Belarusian,
        Language::Armenian,
        Language::Arabic,
        Language::Hindi,
        Language::Greek,
        Language::Irish,
    ];

    /// ISO 639-1 code.
    pub fn code(self) -> &'static str {
        match self {
            Language::Japanese => "ja",
            Language::English => "en",
            Language::Finnish => "fi",
            Language::Russian => "ru",
            Language::Spanish => "es",
            Language::French => "fr",
            Language::Italian => "it",
            Language::Korean => "ko",
            Language::Chinese => "zh",
            Language::German => "de",
            Language::Kyrgyz => "ky",
            Language::Kazakh => "kk",
            Language::Bulgarian => "bg",
            Language::Belarusian => "be",
            Language::Armenian => "hy",
            Language::Arabic => "ar",
            Language::Hindi => "hi",
            Language::Greek => "el",
            Language::Irish => "ga",
        }
    }

    /// The language's name for itself.
    pub fn display_name(self) -> &'static str {
        match self {
            Language::Japanese => "日本語",
            Language::English => "English",
            Language::Finnish => "Suomi",
            Language::Russian => "Русский",
            Language::Spanish => "Español",
            Language::French => "Français",
            Language::Italian => "Italiano",
            Language::Korean => "한국어",
            Language::Chinese => "中文",
            Language::German => "Deutsch",
            Language::Kyrgyz => "Кыргызча",
            Language::Kazakh => "Қазақша",
            Language::Bulgarian => "Български",
            Language::Belarusian => "Беларуская",
            Language::Armenian => "Հայերեն",
            Language::Arabic => "العربية",
            Language::Hindi => "हिन्दी",
            Language::Greek => "Ελληνικά",
            Language::Irish => "Gaeilge",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Language::ALL
            .iter()
            .copied()
            .find(|language| language.code().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unsupported language code: {}", s))
    }
}

/// The exercise formats a generated sentence can be used for.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExerciseKind {
    WordArrangement,
    FillInTheBlank,
    Speaking,
    Writing,
}

impl ExerciseKind {
    pub fn display_name(self) -> &'static str {
        match self {
            ExerciseKind::WordArrangement => "Word Arrangement",
            ExerciseKind::FillInTheBlank => "Fill in the Blank",
            ExerciseKind::Speaking => "Speaking",
            ExerciseKind::Writing => "Writing",
        }
    }

    fn key(self) -> &'static str {
        match self {
            ExerciseKind::WordArrangement => "word_arrangement",
            ExerciseKind::FillInTheBlank => "fill_in_the_blank",
            ExerciseKind::Speaking => "speaking",
            ExerciseKind::Writing => "writing",
        }
    }
}

impl fmt::Display for ExerciseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for ExerciseKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            ExerciseKind::WordArrangement,
            ExerciseKind::FillInTheBlank,
            ExerciseKind::Speaking,
            ExerciseKind::Writing,
        ]
        .into_iter()
        .find(|kind| kind.key() == s.trim())
        .ok_or_else(|| format!("unknown exercise kind: {}", s))
    }
}
