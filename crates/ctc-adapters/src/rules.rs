//! Keyword tables that drive extraction, loadable from YAML.

use std::path::Path;

use ctc_core::{canonical_month, DEFAULT_CATEGORY, DEFAULT_TOURNAMENT_TYPE};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RulesError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing rules yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("month token {token:?} maps to unknown month {month:?}")]
    UnknownMonth { token: String, month: String },
}

/// On-disk shape of `rules/extraction.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RulesFile {
    pub version: u32,
    pub month_tokens: Vec<MonthToken>,
    pub max_section_depth: usize,
    pub name_tags: Vec<String>,
    pub min_tag_text_len: usize,
    pub min_free_text_len: usize,
    pub name_pattern: String,
    pub international_keywords: Vec<String>,
    pub cities: Vec<String>,
    pub city_fallback_pattern: String,
    pub countries: Vec<String>,
    pub tournament_types: Vec<PatternRule>,
    pub default_tournament_type: String,
    pub categories: Vec<PatternRule>,
    pub default_category: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthToken {
    pub token: String,
    pub month: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternRule {
    pub pattern: String,
    pub value: String,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

fn pattern_rules(items: &[(&str, &str)]) -> Vec<PatternRule> {
    items
        .iter()
        .map(|(pattern, value)| PatternRule {
            pattern: (*pattern).to_string(),
            value: (*value).to_string(),
        })
        .collect()
}

impl Default for RulesFile {
    fn default() -> Self {
        let german = [
            ("Januar", "January"),
            ("Februar", "February"),
            ("März", "March"),
            ("April", "April"),
            ("Mai", "May"),
            ("Juni", "June"),
            ("Juli", "July"),
            ("August", "August"),
            ("September", "September"),
            ("Oktober", "October"),
            ("November", "November"),
            ("Dezember", "December"),
        ];
        let abbreviated = [
            ("Jan", "January"),
            ("Feb", "February"),
            ("Mar", "March"),
            ("Apr", "April"),
            ("May", "May"),
            ("Jun", "June"),
            ("Jul", "July"),
            ("Aug", "August"),
            ("Sep", "September"),
            ("Oct", "October"),
            ("Nov", "November"),
            ("Dec", "December"),
        ];
        Self {
            version: 1,
            month_tokens: german
                .iter()
                .chain(abbreviated.iter())
                .map(|(token, month)| MonthToken {
                    token: (*token).to_string(),
                    month: (*month).to_string(),
                })
                .collect(),
            max_section_depth: 3,
            name_tags: strings(&["a", "strong", "b", "h1", "h2", "h3", "h4", "h5", "h6"]),
            min_tag_text_len: 3,
            min_free_text_len: 10,
            name_pattern: "(?i)(open|championship|tournament|cup|masters|schach|turnier)".into(),
            international_keywords: strings(&[
                "International",
                "World",
                "European",
                "Europe",
                "FIDE",
                "Weltmeisterschaft",
                "Europameisterschaft",
            ]),
            cities: strings(&[
                "Berlin",
                "Hamburg",
                "München",
                "Köln",
                "Frankfurt",
                "Stuttgart",
                "Düsseldorf",
                "Leipzig",
                "Dortmund",
                "Essen",
                "Dresden",
                "Bremen",
                "Hannover",
                "Nürnberg",
                "Duisburg",
                "Bochum",
                "Wuppertal",
                "Bonn",
                "Mannheim",
                "Karlsruhe",
                "Münster",
                "Wiesbaden",
                "Augsburg",
            ]),
            city_fallback_pattern: r"\bin\s+(\p{Lu}\p{Ll}+(?:\s+\p{Lu}\p{Ll}+)?)".into(),
            countries: strings(&[
                "Germany",
                "France",
                "Spain",
                "Italy",
                "Netherlands",
                "Belgium",
                "Austria",
                "Switzerland",
                "Denmark",
                "Sweden",
                "Norway",
                "Finland",
                "Poland",
                "Czech Republic",
                "Hungary",
                "Romania",
                "Bulgaria",
                "Greece",
                "Portugal",
                "Ireland",
                "UK",
                "United Kingdom",
            ]),
            tournament_types: pattern_rules(&[
                ("(?i)(rapid|schnell)", "Rapid"),
                ("(?i)blitz", "Blitz"),
                ("(?i)(online|internet)", "Online"),
            ]),
            default_tournament_type: DEFAULT_TOURNAMENT_TYPE.into(),
            categories: pattern_rules(&[
                (r"(?i)(junior|jugend|youth|\bu\d{1,2}\b)", "Youth"),
                ("(?i)(women|frauen|damen)", "Women"),
                ("(?i)(senior|senioren)", "Senior"),
                ("(?i)(team|mannschaft|verein)", "Team"),
            ]),
            default_category: DEFAULT_CATEGORY.into(),
        }
    }
}

fn compile(pattern: &str) -> Result<Regex, RulesError> {
    Regex::new(pattern).map_err(|source| RulesError::Pattern {
        pattern: pattern.to_string(),
        source,
    })
}

/// Ordered predicate → value list; the first matching rule wins.
#[derive(Debug, Clone)]
pub struct RuleTable {
    rules: Vec<(Regex, String)>,
    fallback: String,
}

impl RuleTable {
    fn compile(rules: &[PatternRule], fallback: &str) -> Result<Self, RulesError> {
        Ok(Self {
            rules: rules
                .iter()
                .map(|r| Ok((compile(&r.pattern)?, r.value.clone())))
                .collect::<Result<_, RulesError>>()?,
            fallback: fallback.to_string(),
        })
    }

    pub fn classify(&self, text: &str) -> &str {
        self.rules
            .iter()
            .find(|(pattern, _)| pattern.is_match(text))
            .map(|(_, value)| value.as_str())
            .unwrap_or(&self.fallback)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct CompiledMonthToken {
    pub(crate) pattern: Regex,
    pub(crate) month: &'static str,
}

/// Compiled form of [`RulesFile`].
#[derive(Debug, Clone)]
pub struct ExtractionRules {
    pub(crate) month_tokens: Vec<CompiledMonthToken>,
    pub(crate) any_month: Regex,
    pub(crate) max_section_depth: usize,
    pub(crate) name_tags: Vec<String>,
    pub(crate) min_tag_text_len: usize,
    pub(crate) min_free_text_len: usize,
    pub(crate) name_pattern: Regex,
    pub(crate) international_keywords: Vec<String>,
    pub(crate) cities: Vec<String>,
    pub(crate) city_fallback: Regex,
    pub(crate) countries: Vec<String>,
    pub tournament_types: RuleTable,
    pub categories: RuleTable,
}

impl ExtractionRules {
    pub fn compile(file: &RulesFile) -> Result<Self, RulesError> {
        let mut month_tokens = Vec::with_capacity(file.month_tokens.len());
        for entry in &file.month_tokens {
            let month =
                canonical_month(&entry.month).ok_or_else(|| RulesError::UnknownMonth {
                    token: entry.token.clone(),
                    month: entry.month.clone(),
                })?;
            month_tokens.push(CompiledMonthToken {
                pattern: compile(&format!(r"\b{}\b", regex::escape(&entry.token)))?,
                month,
            });
        }
        let alternation = file
            .month_tokens
            .iter()
            .map(|t| regex::escape(&t.token))
            .collect::<Vec<_>>()
            .join("|");

        Ok(Self {
            month_tokens,
            any_month: compile(&format!(r"\b(?:{alternation})\b"))?,
            max_section_depth: file.max_section_depth,
            name_tags: file.name_tags.iter().map(|t| t.to_ascii_lowercase()).collect(),
            min_tag_text_len: file.min_tag_text_len,
            min_free_text_len: file.min_free_text_len,
            name_pattern: compile(&file.name_pattern)?,
            international_keywords: file
                .international_keywords
                .iter()
                .map(|k| k.to_lowercase())
                .collect(),
            cities: file.cities.clone(),
            city_fallback: compile(&file.city_fallback_pattern)?,
            countries: file.countries.clone(),
            tournament_types: RuleTable::compile(
                &file.tournament_types,
                &file.default_tournament_type,
            )?,
            categories: RuleTable::compile(&file.categories, &file.default_category)?,
        })
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, RulesError> {
        let file: RulesFile = serde_yaml::from_str(yaml)?;
        Self::compile(&file)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, RulesError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|source| RulesError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&yaml)
    }
}

impl Default for ExtractionRules {
    fn default() -> Self {
        Self::compile(&RulesFile::default()).expect("built-in extraction rules compile")
    }
}
