//! Turns a calendar page into candidate tournament records.

pub mod rules;

use std::collections::HashSet;

use chrono::{Datelike, Utc};
use ctc_core::{TournamentRecord, DEFAULT_HOME_COUNTRY};
use regex::Regex;
use scraper::{ElementRef, Html};
use tracing::debug;

pub use rules::{ExtractionRules, MonthToken, PatternRule, RuleTable, RulesError, RulesFile};

pub const CRATE_NAME: &str = "ctc-adapters";

/// Text containers never scanned for month labels or names.
const SKIPPED_PARENTS: &[&str] = &["script", "style", "noscript", "template"];

/// A month heading and the element considered to hold its tournaments.
struct MonthSection<'a> {
    month: &'static str,
    element: ElementRef<'a>,
}

/// Stateless HTML → [`TournamentRecord`] extraction driven by [`ExtractionRules`].
#[derive(Debug, Clone)]
pub struct Extractor {
    rules: ExtractionRules,
    home_country: String,
    year_pattern: Regex,
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new(ExtractionRules::default(), DEFAULT_HOME_COUNTRY)
    }
}

impl Extractor {
    pub fn new(rules: ExtractionRules, home_country: impl Into<String>) -> Self {
        Self {
            rules,
            home_country: home_country.into(),
            year_pattern: Regex::new(r"\d{4}").expect("static year pattern compiles"),
        }
    }

    pub fn rules(&self) -> &ExtractionRules {
        &self.rules
    }

    pub fn home_country(&self) -> &str {
        &self.home_country
    }

    /// Extracts with the current calendar year as the fallback year.
    pub fn extract(&self, html: &str) -> Vec<TournamentRecord> {
        self.extract_with_fallback_year(html, Utc::now().year())
    }

    /// Never fails: markup that yields nothing produces an empty list.
    pub fn extract_with_fallback_year(&self, html: &str, fallback_year: i32) -> Vec<TournamentRecord> {
        let year = self.page_year(html).unwrap_or(fallback_year);
        let document = Html::parse_document(html);
        let texts = text_nodes(document.root_element());

        let mut records = Vec::new();
        for section in self.month_sections(&texts) {
            let names = self.candidate_names(section.element);
            debug!(month = section.month, year, candidates = names.len(), "month section");
            records.extend(
                names
                    .into_iter()
                    .map(|name| self.classify(&name, section.month, year)),
            );
        }
        records
    }

    /// First four-digit run anywhere in the raw markup.
    pub fn page_year(&self, html: &str) -> Option<i32> {
        self.year_pattern
            .find(html)
            .and_then(|m| m.as_str().parse::<i32>().ok())
            .filter(|year| *year > 0)
    }

    /// Builds a record from a tournament name using the keyword tables.
    pub fn classify(&self, name: &str, month: &str, year: i32) -> TournamentRecord {
        let is_international = self.is_international(name);
        let mut record = TournamentRecord::new(name, month, year);
        record.is_international = is_international;
        record.city = self.city_of(name);
        record.country = Some(self.country_of(name, is_international));
        record.tournament_type = Some(self.rules.tournament_types.classify(name).to_string());
        record.category = Some(self.rules.categories.classify(name).to_string());
        record
    }

    pub fn is_international(&self, name: &str) -> bool {
        let lowered = name.to_lowercase();
        self.rules
            .international_keywords
            .iter()
            .any(|keyword| lowered.contains(keyword.as_str()))
    }

    pub fn city_of(&self, name: &str) -> Option<String> {
        if let Some(city) = self.rules.cities.iter().find(|city| name.contains(city.as_str())) {
            return Some(city.clone());
        }
        self.rules
            .city_fallback
            .captures(name)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    }

    /// Only international events are matched against the country list.
    pub fn country_of(&self, name: &str, is_international: bool) -> String {
        if is_international {
            if let Some(country) = self
                .rules
                .countries
                .iter()
                .find(|country| name.contains(country.as_str()))
            {
                return country.clone();
            }
        }
        self.home_country.clone()
    }

    /// One section per canonical month, in rule-table order. The first text node
    /// carrying any token of a month wins.
    fn month_sections<'a>(&self, texts: &[(ElementRef<'a>, String)]) -> Vec<MonthSection<'a>> {
        let mut seen = HashSet::new();
        let mut sections = Vec::new();
        for token in &self.rules.month_tokens {
            if seen.contains(token.month) {
                continue;
            }
            let Some((parent, label)) = texts.iter().find(|(_, text)| token.pattern.is_match(text))
            else {
                continue;
            };
            seen.insert(token.month);
            sections.push(MonthSection {
                month: token.month,
                element: self.section_for(*parent, label),
            });
        }
        sections
    }

    /// Smallest ancestor, at most `max_section_depth` levels above the label's
    /// parent, whose text holds more than the label itself.
    fn section_for<'a>(&self, parent: ElementRef<'a>, label: &str) -> ElementRef<'a> {
        let label = squash(label);
        let mut current = parent;
        for _ in 0..=self.rules.max_section_depth {
            if squash(&element_text(current)) != label {
                return current;
            }
            match current.parent().and_then(ElementRef::wrap) {
                Some(next) => current = next,
                None => break,
            }
        }
        parent
    }

    fn candidate_names(&self, section: ElementRef<'_>) -> Vec<String> {
        let mut names = Vec::new();

        for element in section.descendants().filter_map(ElementRef::wrap) {
            let tag = element.value().name();
            if !self.rules.name_tags.iter().any(|t| t == tag) {
                continue;
            }
            let text = collapse_whitespace(&element_text(element));
            if text.chars().count() > self.rules.min_tag_text_len && !self.is_month_label(&text) {
                names.push(text);
            }
        }

        for (_, text) in text_nodes(section) {
            let text = collapse_whitespace(&text);
            if text.chars().count() > self.rules.min_free_text_len
                && self.rules.name_pattern.is_match(&text)
            {
                names.push(text);
            }
        }

        let mut seen = HashSet::new();
        names.retain(|name| seen.insert(name.clone()));
        names
    }

    /// True for headings such as "April" or "März 2025" that consist only of
    /// month tokens, digits and punctuation.
    fn is_month_label(&self, text: &str) -> bool {
        self.rules.any_month.is_match(text)
            && !self
                .rules
                .any_month
                .replace_all(text, "")
                .chars()
                .any(char::is_alphabetic)
    }
}

/// Text nodes under `root` with their parent element, in document order.
fn text_nodes(root: ElementRef<'_>) -> Vec<(ElementRef<'_>, String)> {
    root.descendants()
        .filter_map(|node| {
            let text: &str = node.value().as_text()?;
            if text.trim().is_empty() {
                return None;
            }
            let parent = node.parent().and_then(ElementRef::wrap)?;
            if SKIPPED_PARENTS.contains(&parent.value().name()) {
                return None;
            }
            Some((parent, text.to_string()))
        })
        .collect()
}

fn element_text(element: ElementRef<'_>) -> String {
    element.text().collect()
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn squash(text: &str) -> String {
    text.chars().filter(|c| !c.is_whitespace()).collect()
}
