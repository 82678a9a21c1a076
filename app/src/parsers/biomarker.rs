// ==============================================================================
// biomarker.rs - Lab Report Biomarker Parser
// ==============================================================================
// Description: Extracts structured biomarker rows from noisy OCR text
// Created: 2026-10-18
// Modified: 2026-10-18
// Version: 1.0.0
// ==============================================================================
// Format: free text, one candidate biomarker per line
// Example:
//   Glucose: 95 mg/dL (Reference: 70-100)
//   hsCRP 0.8 mg/L < 1.0
//   HbA1c 5.6% Reference: < 5.7
//   Platelets: 250 x10³/µL (Normal: 150-400)
//   Vitamin D 32 ng/mL
// ==============================================================================

use regex::{Captures, Regex};
use std::sync::LazyLock;
use tracing::debug;

use crate::models::BiomarkerCandidate;

/// Lines shorter than this (after trimming) are never biomarker rows
pub const MIN_LINE_CHARS: usize = 3;

/// The bare fallback rule only trusts names longer than this
pub const MIN_BARE_NAME_CHARS: usize = 3;

// Shared fragments. Names never contain comparison signs or parentheses so
// that a trailing `< bound` or `(Normal: ...)` cannot be swallowed into the
// name of an earlier rule. Units must start with a letter, `µ` or `%`, so a
// value is never split from the rest of its own digit run.
const NAME: &str = r"(?P<name>[^<>()]+?)";
const SEP: &str = r"[:\s]+";
const NUM: &str = r"\d+(?:\.\d+)?";
const UNIT: &str = r"(?P<unit>[a-zµμ%][a-z0-9µμ%/^.]*)";
// OCR'd units such as `x10³/µL` carry symbols the strict unit rejects
const LOOSE_UNIT: &str = r"(?P<unit>[a-zµμ%][^\s<>()]*)";

static RANGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile(&format!(
        r"(?i)^{NAME}{SEP}(?P<value>{NUM})\s*{UNIT}?(?:(?:\s+\(?|\s*\()\s*(?:(?:reference|normal|range)(?:\s+range)?\s*:?\s*)?(?P<low>{NUM})\s*-\s*(?P<high>{NUM})\s*\)?)?\s*$"
    ))
});

static UPPER_BOUND_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile(&format!(
        r"(?i)^{NAME}{SEP}(?P<value>{NUM})\s*{UNIT}?\s*<\s*(?P<high>{NUM})\s*$"
    ))
});

static PERCENT_REFERENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile(&format!(
        r"(?i)^{NAME}{SEP}(?P<value>{NUM})\s*%?\s*reference:\s*<\s*(?P<high>{NUM})\s*$"
    ))
});

static PARENTHESIZED_NORMAL_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile(&format!(
        r"(?i)^(?P<name>[^:<>()]+?)\s*:\s*(?P<value>{NUM})\s*{LOOSE_UNIT}?\s*\(\s*normal\s*:\s*(?P<low>{NUM})\s*-\s*(?P<high>{NUM})\s*\)\s*$"
    ))
});

static BARE_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile(&format!(
        r"(?i)^{NAME}{SEP}(?P<value>{NUM})\s*{LOOSE_UNIT}?\s*$"
    ))
});

fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).expect("biomarker pattern must compile")
}

/// Extraction rule that produced a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchRule {
    /// `name value unit (Reference: low-high)`, range optional
    Range,
    /// `name value unit < high`
    UpperBound,
    /// `name value% Reference: < high`
    PercentReference,
    /// `name: value unit (Normal: low-high)`
    ParenthesizedNormal,
    /// `name value unit` with nothing else on the line
    Bare,
}

impl MatchRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchRule::Range => "range",
            MatchRule::UpperBound => "upper_bound",
            MatchRule::PercentReference => "percent_reference",
            MatchRule::ParenthesizedNormal => "parenthesized_normal",
            MatchRule::Bare => "bare",
        }
    }
}

type Matcher = fn(&str) -> Option<BiomarkerCandidate>;

/// Ordered, first-match-wins rule chain. Order is load-bearing.
pub const PATTERN_CHAIN: [(MatchRule, Matcher); 5] = [
    (MatchRule::Range, match_range),
    (MatchRule::UpperBound, match_upper_bound),
    (MatchRule::PercentReference, match_percent_reference),
    (MatchRule::ParenthesizedNormal, match_parenthesized_normal),
    (MatchRule::Bare, match_bare),
];

/// Candidate plus the rule that matched it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLine {
    pub line_number: usize,
    pub rule: MatchRule,
    pub candidate: BiomarkerCandidate,
}

/// Line accounting for a single parser run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseStats {
    pub total_lines: usize,
    pub considered_lines: usize,
    pub matched_lines: usize,
}

impl ParseStats {
    pub fn dropped_lines(&self) -> usize {
        self.considered_lines - self.matched_lines
    }
}

/// Parser for OCR'd lab report text
///
/// Never fails: lines that match no rule are dropped, so the worst case is an
/// empty result.
#[derive(Debug, Clone, Copy, Default)]
pub struct BiomarkerParser;

impl BiomarkerParser {
    pub fn new() -> Self {
        Self
    }

    /// Parse every line of `text`, returning candidates in line order
    pub fn parse(&self, text: &str) -> Vec<BiomarkerCandidate> {
        self.parse_with_stats(text)
            .0
            .into_iter()
            .map(|parsed| parsed.candidate)
            .collect()
    }

    /// Parse `text`, keeping the matched rule per line and line counts
    pub fn parse_with_stats(&self, text: &str) -> (Vec<ParsedLine>, ParseStats) {
        let mut stats = ParseStats::default();
        let mut parsed = Vec::new();

        for (index, raw_line) in text.lines().enumerate() {
            stats.total_lines += 1;

            let line = raw_line.trim();
            if line.chars().count() < MIN_LINE_CHARS {
                continue;
            }
            stats.considered_lines += 1;

            if let Some((rule, candidate)) = parse_line(line) {
                debug!(
                    line_number = index + 1,
                    rule = rule.as_str(),
                    test_name = %candidate.test_name,
                    "Matched biomarker line"
                );
                stats.matched_lines += 1;
                parsed.push(ParsedLine {
                    line_number: index + 1,
                    rule,
                    candidate,
                });
            }
        }

        (parsed, stats)
    }
}

/// Run the rule chain over one already-trimmed line
pub fn parse_line(line: &str) -> Option<(MatchRule, BiomarkerCandidate)> {
    PATTERN_CHAIN
        .iter()
        .find_map(|(rule, matcher)| matcher(line).map(|candidate| (*rule, candidate)))
}

fn match_range(line: &str) -> Option<BiomarkerCandidate> {
    RANGE_RE.captures(line).and_then(|caps| candidate(&caps, None))
}

fn match_upper_bound(line: &str) -> Option<BiomarkerCandidate> {
    UPPER_BOUND_RE.captures(line).and_then(|caps| candidate(&caps, None))
}

fn match_percent_reference(line: &str) -> Option<BiomarkerCandidate> {
    PERCENT_REFERENCE_RE
        .captures(line)
        .and_then(|caps| candidate(&caps, Some("%")))
}

fn match_parenthesized_normal(line: &str) -> Option<BiomarkerCandidate> {
    PARENTHESIZED_NORMAL_RE
        .captures(line)
        .and_then(|caps| candidate(&caps, None))
}

fn match_bare(line: &str) -> Option<BiomarkerCandidate> {
    BARE_RE
        .captures(line)
        .and_then(|caps| candidate(&caps, None))
        .filter(|c| c.test_name.chars().count() > MIN_BARE_NAME_CHARS)
}

/// Build a candidate from named captures; `fixed_unit` overrides any capture
fn candidate(caps: &Captures<'_>, fixed_unit: Option<&str>) -> Option<BiomarkerCandidate> {
    let test_name = caps.name("name")?.as_str().trim();
    if test_name.is_empty() {
        return None;
    }

    let capture = |group: &str| caps.name(group).map(|m| m.as_str().to_string());

    Some(BiomarkerCandidate {
        test_name: test_name.to_string(),
        value: caps.name("value")?.as_str().to_string(),
        unit: fixed_unit.map(str::to_string).or_else(|| capture("unit")),
        reference_range_low: capture("low"),
        reference_range_high: capture("high"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expect(
        name: &str,
        value: &str,
        unit: Option<&str>,
        low: Option<&str>,
        high: Option<&str>,
    ) -> BiomarkerCandidate {
        BiomarkerCandidate {
            test_name: name.to_string(),
            value: value.to_string(),
            unit: unit.map(str::to_string),
            reference_range_low: low.map(str::to_string),
            reference_range_high: high.map(str::to_string),
        }
    }

    #[test]
    fn test_reference_range_line() {
        let parsed = BiomarkerParser::new().parse("Glucose: 95 mg/dL (Reference: 70-100)");
        assert_eq!(
            parsed,
            vec![expect("Glucose", "95", Some("mg/dL"), Some("70"), Some("100"))]
        );
    }

    #[test]
    fn test_upper_bound_line() {
        let parsed = BiomarkerParser::new().parse("hsCRP 0.8 mg/L < 1.0");
        assert_eq!(parsed, vec![expect("hsCRP", "0.8", Some("mg/L"), None, Some("1.0"))]);

        let (lines, _) = BiomarkerParser::new().parse_with_stats("hsCRP 0.8 mg/L < 1.0");
        assert_eq!(lines[0].rule, MatchRule::UpperBound);
    }

    #[test]
    fn test_three_char_noise_yields_nothing() {
        assert!(BiomarkerParser::new().parse("xyz").is_empty());
    }

    #[test]
    fn test_short_lines_are_skipped() {
        let (parsed, stats) = BiomarkerParser::new().parse_with_stats("  K4 \n\n 9 \nab");
        assert!(parsed.is_empty());
        assert_eq!(stats.total_lines, 4);
        assert_eq!(stats.considered_lines, 0);
    }

    #[test]
    fn test_range_rule_takes_precedence_over_bare() {
        // Both the range rule (no range captured) and the bare rule accept this line
        let line = "Hemoglobin 14.2 g/dL";
        assert!(match_range(line).is_some());
        assert!(match_bare(line).is_some());

        let (rule, candidate) = parse_line(line).unwrap();
        assert_eq!(rule, MatchRule::Range);
        assert_eq!(candidate, expect("Hemoglobin", "14.2", Some("g/dL"), None, None));
    }

    #[test]
    fn test_range_rule_accepts_short_names_bare_rule_does_not() {
        let (rule, candidate) = parse_line("Na 140 mmol/L").unwrap();
        assert_eq!(rule, MatchRule::Range);
        assert_eq!(candidate.test_name, "Na");
        assert!(match_bare("Na 140 mmol/L").is_none());
    }

    #[test]
    fn test_value_only_range_fields_absent() {
        let (rule, candidate) = parse_line("Vitamin D 32 ng/mL").unwrap();
        assert_eq!(rule, MatchRule::Range);
        assert_eq!(candidate.reference_range_low, None);
        assert_eq!(candidate.reference_range_high, None);
    }

    #[test]
    fn test_range_variants() {
        let parser = BiomarkerParser::new();

        assert_eq!(
            parser.parse("LDL Cholesterol 128 mg/dL Reference Range: 0-99"),
            vec![expect("LDL Cholesterol", "128", Some("mg/dL"), Some("0"), Some("99"))]
        );
        assert_eq!(
            parser.parse("TSH 2.1 uIU/mL 0.4 - 4.0"),
            vec![expect("TSH", "2.1", Some("uIU/mL"), Some("0.4"), Some("4.0"))]
        );
        assert_eq!(
            parser.parse("GLUCOSE 95 MG/DL (NORMAL: 70-100)"),
            vec![expect("GLUCOSE", "95", Some("MG/DL"), Some("70"), Some("100"))]
        );
    }

    #[test]
    fn test_percent_reference_line() {
        let (rule, candidate) = parse_line("HbA1c 5.6% Reference: < 5.7").unwrap();
        assert_eq!(rule, MatchRule::PercentReference);
        assert_eq!(candidate, expect("HbA1c", "5.6", Some("%"), None, Some("5.7")));
    }

    #[test]
    fn test_parenthesized_normal_with_unusual_unit() {
        let (rule, candidate) = parse_line("Platelets: 250 x10³/µL (Normal: 150-400)").unwrap();
        assert_eq!(rule, MatchRule::ParenthesizedNormal);
        assert_eq!(
            candidate,
            expect("Platelets", "250", Some("x10³/µL"), Some("150"), Some("400"))
        );
    }

    #[test]
    fn test_bare_rule_fallback_and_name_guard() {
        let (rule, candidate) = parse_line("Platelets 250 x10³/µL").unwrap();
        assert_eq!(rule, MatchRule::Bare);
        assert_eq!(candidate.unit.as_deref(), Some("x10³/µL"));

        // Only the bare rule could take this line, and "K" is too short
        assert!(parse_line("K 4.1 mmol/L*").is_none());
    }

    #[test]
    fn test_normal_range_line_not_split_by_range_rule() {
        let line = "Platelets: 250 x10³/µL (Normal: 150-400)";
        assert!(match_range(line).is_none());

        let (parsed, _) = BiomarkerParser::new().parse_with_stats(line);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].rule, MatchRule::ParenthesizedNormal);
        assert_eq!(parsed[0].candidate.test_name, "Platelets");
        assert_eq!(parsed[0].candidate.value, "250");
    }

    #[test]
    fn test_hyphenated_digit_runs_are_not_ranges() {
        assert!(match_range("Phone: 555-1234").is_none());
        assert!(parse_line("Phone: 555-1234").is_none());
        assert!(parse_line("Order 2024-0042").is_none());
    }

    #[test]
    fn test_header_lines_with_dates_yield_nothing() {
        let text = "Date: 2024-01-15\nCollected: 01/15/2024\nPhone: 555-1234\nAccession 12/34";
        let (parsed, stats) = BiomarkerParser::new().parse_with_stats(text);
        assert!(parsed.is_empty(), "unexpected candidates: {:?}", parsed);
        assert_eq!(stats.considered_lines, 4);
    }

    #[test]
    fn test_unit_without_space_after_value() {
        let (rule, candidate) = parse_line("Glucose 95mg/dL").unwrap();
        assert_eq!(rule, MatchRule::Range);
        assert_eq!(candidate, expect("Glucose", "95", Some("mg/dL"), None, None));
    }

    #[test]
    fn test_lines_trimmed_and_kept_in_order() {
        let text = "  PATIENT: Jane Doe  \r\n\
                    \tGlucose: 95 mg/dL (Reference: 70-100)   \r\n\
                    Page one of two\r\n\
                    hsCRP 0.8 mg/L < 1.0\n\
                    Glucose: 95 mg/dL (Reference: 70-100)\n";
        let (parsed, stats) = BiomarkerParser::new().parse_with_stats(text);

        let names: Vec<_> = parsed.iter().map(|p| p.candidate.test_name.as_str()).collect();
        assert_eq!(names, vec!["Glucose", "hsCRP", "Glucose"]);
        assert_eq!(parsed[0].line_number, 2);
        assert_eq!(stats.matched_lines, 3);
        assert_eq!(stats.dropped_lines(), 2);
    }

    #[test]
    fn test_parse_is_deterministic() {
        let text = "Glucose: 95 mg/dL (Reference: 70-100)\nhsCRP 0.8 mg/L < 1.0\nnoise";
        let parser = BiomarkerParser::new();
        assert_eq!(parser.parse(text), parser.parse(text));
    }

    #[test]
    fn test_pattern_chain_order() {
        let order: Vec<_> = PATTERN_CHAIN.iter().map(|(rule, _)| *rule).collect();
        assert_eq!(
            order,
            vec![
                MatchRule::Range,
                MatchRule::UpperBound,
                MatchRule::PercentReference,
                MatchRule::ParenthesizedNormal,
                MatchRule::Bare,
            ]
        );
    }
}
