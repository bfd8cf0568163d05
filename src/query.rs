//! Query anti-pattern scanning.

use std::fmt::{self, Display, Formatter};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::constants::{OPTIMIZED_REQUEST_MS, QUERY_SUGGESTION_IMPROVEMENT};

/// Source label on every suggestion the scanner produces
pub const SCANNER_SUGGESTION_KIND: &str = "Intelligent-Scanner";

static SELECT_STAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)SELECT\s+\*").expect("valid SELECT_STAR pattern"));
// single-line statement starting with SELECT; WHERE is checked separately
static SELECT_STATEMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\ASELECT\b[^\n]*\z").expect("valid SELECT statement pattern"));
static WHERE_CLAUSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bWHERE\b").expect("valid WHERE pattern"));
static FUZZY_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\$regex\b").expect("valid FUZZY_REGEX pattern"));
static MULTIPLE_JOINS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\bJOIN\b.*){3,}").expect("valid MULTIPLE_JOINS pattern"));

// ----------------------------------------------------------------------------
// Patterns
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryPattern {
    SelectStar,
    MissingWhere,
    FuzzyRegex,
    MultipleJoins,
}

impl QueryPattern {
    /// All patterns in evaluation order
    pub const ALL: [QueryPattern; 4] = [
        QueryPattern::SelectStar,
        QueryPattern::MissingWhere,
        QueryPattern::FuzzyRegex,
        QueryPattern::MultipleJoins,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            QueryPattern::SelectStar => "SELECT_STAR",
            QueryPattern::MissingWhere => "MISSING_WHERE",
            QueryPattern::FuzzyRegex => "FUZZY_REGEX",
            QueryPattern::MultipleJoins => "MULTIPLE_JOINS",
        }
    }

    pub fn suggestion(&self) -> &'static str {
        match self {
            QueryPattern::SelectStar => {
                "Avoid SELECT *. Explicitly list required columns to reduce I/O and memory overhead."
            }
            QueryPattern::MissingWhere => {
                "Missing WHERE clause detected. Large tables will cause full collection scans."
            }
            QueryPattern::FuzzyRegex => {
                "Regex-based matching detected. Use indexed text search or exact equality for performance."
            }
            QueryPattern::MultipleJoins => {
                "Multiple joins detected. Verify query plan for nested loop inefficiencies."
            }
        }
    }

    pub fn matches(&self, query: &str) -> bool {
        match self {
            QueryPattern::SelectStar => SELECT_STAR.is_match(query),
            QueryPattern::MissingWhere => SELECT_STATEMENT.is_match(query) && !WHERE_CLAUSE.is_match(query),
            QueryPattern::FuzzyRegex => FUZZY_REGEX.is_match(query),
            QueryPattern::MultipleJoins => MULTIPLE_JOINS.is_match(query),
        }
    }
}

impl Display for QueryPattern {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

// ----------------------------------------------------------------------------
// Query Analysis
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationSuggestion {
    #[serde(rename = "type")]
    pub kind: String,
    pub pattern: QueryPattern,
    pub suggestion: String,
    pub potential_improvement: f64,
}

impl From<QueryPattern> for OptimizationSuggestion {
    fn from(pattern: QueryPattern) -> Self {
        Self {
            kind: SCANNER_SUGGESTION_KIND.into(),
            pattern,
            suggestion: pattern.suggestion().into(),
            potential_improvement: QUERY_SUGGESTION_IMPROVEMENT,
        }
    }
}

/// Scanner verdict for one query or request line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryAnalysis {
    pub query_text: String,
    pub database: String,
    #[serde(rename = "executionTime")]
    pub execution_time_ms: f64,
    pub is_optimized: bool,
    #[serde(rename = "optimizationSuggestions")]
    pub suggestions: Vec<OptimizationSuggestion>,
}

impl QueryAnalysis {
    pub fn patterns(&self) -> impl Iterator<Item = QueryPattern> + '_ {
        self.suggestions.iter().map(|s| s.pattern)
    }

    pub fn has_pattern(&self, pattern: QueryPattern) -> bool {
        self.patterns().any(|p| p == pattern)
    }
}

// ----------------------------------------------------------------------------
// Scanner
// ----------------------------------------------------------------------------

/// Stateless regex scanner for query anti-patterns
#[derive(Debug, Default, Clone, Copy)]
pub struct QueryPatternScanner;

impl QueryPatternScanner {
    pub fn new() -> Self {
        Self
    }

    /// Patterns matching `query`, in evaluation order
    pub fn detect(&self, query: &str) -> Vec<QueryPattern> {
        QueryPattern::ALL
            .iter()
            .copied()
            .filter(|pattern| pattern.matches(query))
            .collect()
    }

    /// Build a full analysis. A query is optimized when nothing matched and
    /// it ran faster than the optimization bound.
    pub fn analyze(&self, query: &str, database: &str, execution_time_ms: f64) -> QueryAnalysis {
        let patterns = self.detect(query);
        QueryAnalysis {
            query_text: query.to_string(),
            database: database.to_string(),
            execution_time_ms,
            is_optimized: patterns.is_empty() && execution_time_ms < OPTIMIZED_REQUEST_MS,
            suggestions: patterns.into_iter().map(OptimizationSuggestion::from).collect(),
        }
    }
}
