// ==============================================================================
// main.rs - labs-parse Entry Point
// ==============================================================================
// Description: Runs the biomarker parser over an extracted-text file and
//              prints the candidates as JSON
// Created: 2026-10-18
// Modified: 2026-10-18
// Version: 1.0.0
// ==============================================================================

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use std::io::Read;
use std::path::PathBuf;
use tracing::info;

use labs_ingest::logging::init_tracing;
use labs_ingest::models::BiomarkerCandidate;
use labs_ingest::BiomarkerParser;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Text file to parse, or `-` for stdin
    input: PathBuf,

    /// Include the matching rule and source line number for each candidate
    #[arg(long)]
    explain: bool,

    /// Pretty-print the JSON output
    #[arg(long)]
    pretty: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExplainedCandidate {
    line_number: usize,
    rule: &'static str,
    #[serde(flatten)]
    candidate: BiomarkerCandidate,
}

fn read_input(input: &PathBuf) -> Result<String> {
    if input.as_os_str() == "-" {
        let mut text = String::new();
        std::io::stdin()
            .read_to_string(&mut text)
            .context("Failed to read stdin")?;
        Ok(text)
    } else {
        std::fs::read_to_string(input)
            .with_context(|| format!("Failed to read {}", input.display()))
    }
}

fn main() -> Result<()> {
    init_tracing("labs_ingest=warn");

    let args = Args::parse();
    let text = read_input(&args.input)?;

    let (parsed, stats) = BiomarkerParser::new().parse_with_stats(&text);
    info!(
        total_lines = stats.total_lines,
        matched = stats.matched_lines,
        dropped = stats.dropped_lines(),
        "Parsed input"
    );

    let output = if args.explain {
        let explained: Vec<_> = parsed
            .into_iter()
            .map(|p| ExplainedCandidate {
                line_number: p.line_number,
                rule: p.rule.as_str(),
                candidate: p.candidate,
            })
            .collect();
        to_json(&explained, args.pretty)?
    } else {
        let candidates: Vec<_> = parsed.into_iter().map(|p| p.candidate).collect();
        to_json(&candidates, args.pretty)?
    };

    println!("{}", output);
    Ok(())
}

fn to_json<T: Serialize>(value: &T, pretty: bool) -> Result<String> {
    let json = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    };
    json.context("Failed to serialize biomarkers")
}
