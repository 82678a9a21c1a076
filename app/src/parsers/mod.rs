// ==============================================================================
// parsers/mod.rs - Text parser modules
// ==============================================================================
// Description: Parsers that turn extracted lab report text into structured rows
// Created: 2026-10-18
// Modified: 2026-10-18
// Version: 1.0.0
// ==============================================================================

pub mod biomarker;

pub use biomarker::{
    parse_line, BiomarkerParser, MatchRule, ParseStats, ParsedLine, PATTERN_CHAIN,
};
