#![recursion_limit = "256"]
//! keyatlas
//! --------
//! Standalone Rust tool to partition flagged keywords by country/region,
//! using OpenAI (GPT-4o class models) with **Structured Outputs (JSON
//! Schema)** to classify keywords that arrive without a country assignment.
//!
//! Pipeline:
//!   keywords.csv -> split preassigned/pending -> batch -> call LLM ->
//!   strict JSON (raw JSON-mode fallback) -> merge buckets -> JSON + CSV
//!
//! Major design goals:
//!  - TOTAL: every loaded keyword lands in the output index, even when the
//!    classifier fails (fallback bucket)
//!  - DETERMINISTIC: sorted, deduplicated buckets so reruns diff cleanly
//!  - SAFE: typed error taxonomy, atomic output writes
//!
//! Console logging: very verbose so you can follow step-by-step.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use reqwest::{Client, StatusCode};
use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

// ================================
// CLI + Config
// ================================

#[derive(Debug, Parser)]
#[command(name="keyatlas", version, about="Partition flagged keywords by country with batched LLM classification")]
struct Cli {
    /// Input keywords CSV
    #[arg(long, value_name="FILE", required_unless_present = "demo")]
    input: Option<PathBuf>,

    /// Run against a small built-in sample keyword list
    #[arg(long, default_value_t = false, conflicts_with = "input")]
    demo: bool,

    /// Output directory (JSON index + detail CSV)
    #[arg(long, value_name="DIR", default_value="./out")]
    out_dir: PathBuf,

    /// OpenAI model ID (e.g., gpt-4o, gpt-4o-mini)
    #[arg(long, default_value="gpt-4o")]
    model: String,

    /// Keywords per classification call
    #[arg(long, default_value_t=10)]
    batch_size: usize,

    /// Max attempts per API call
    #[arg(long, default_value_t=3)]
    max_retries: usize,

    /// Max parallel batch requests
    #[arg(long, default_value_t=4)]
    concurrency: usize,

    /// Sampling temperature for classification calls
    #[arg(long, default_value_t=0.1)]
    temperature: f32,

    /// Overall HTTP request timeout in seconds
    #[arg(long, default_value_t=120)]
    timeout_seconds: u64,

    /// Optional file containing custom classification instructions
    #[arg(long, value_name="FILE")]
    prompt_file: Option<PathBuf>,

    /// Country bucket for keywords the classifier cannot place
    #[arg(long, default_value="ALL")]
    fallback_country: String,

    /// Override the API base URL (e.g., a local proxy)
    #[arg(long, value_name="URL")]
    base_url: Option<String>,
}

#[derive(Debug, Clone)]
struct Config {
    model: String,
    batch_size: usize,
    max_retries: usize,
    concurrency: usize,
    temperature: f32,
    timeout_seconds: u64,
    out_dir: PathBuf,
    fallback: Country,
    base_url: String,
}

// ================================
// Error taxonomy
// ================================

#[derive(Debug, Error)]
enum PipelineError {
    #[error("Input format error: {0}")]
    InputFormat(String),

    #[error("No usable keyword rows after cleanup")]
    NoRecords,

    #[error("Transient API error: {0}")]
    TransientApi(String),

    #[error("Schema validation error: {0}")]
    SchemaValidation(String),

    #[error("Permanent API error: {0}")]
    PermanentApi(String),

    #[error("Write error: {0}")]
    Write(String),
}

// ================================
// Data model
// ================================

/// The fixed set of target country codes, plus the `ALL` bucket for terms
/// that apply globally. `ALL` is declared last so ordered maps list the
/// country buckets first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
enum Country {
    AU,
    BR,
    CA,
    CN,
    DE,
    ES,
    FR,
    IN,
    IT,
    JP,
    MX,
    NL,
    PL,
    RU,
    SA,
    SE,
    TR,
    UAE,
    UK,
    US,
    ALL,
}

impl Country {
    const TAXONOMY: [Country; 21] = [
        Country::AU,
        Country::BR,
        Country::CA,
        Country::CN,
        Country::DE,
        Country::ES,
        Country::FR,
        Country::IN,
        Country::IT,
        Country::JP,
        Country::MX,
        Country::NL,
        Country::PL,
        Country::RU,
        Country::SA,
        Country::SE,
        Country::TR,
        Country::UAE,
        Country::UK,
        Country::US,
        Country::ALL,
    ];

    fn as_str(self) -> &'static str {
        match self {
            Country::AU => "AU",
            Country::BR => "BR",
            Country::CA => "CA",
            Country::CN => "CN",
            Country::DE => "DE",
            Country::ES => "ES",
            Country::FR => "FR",
            Country::IN => "IN",
            Country::IT => "IT",
            Country::JP => "JP",
            Country::MX => "MX",
            Country::NL => "NL",
            Country::PL => "PL",
            Country::RU => "RU",
            Country::SA => "SA",
            Country::SE => "SE",
            Country::TR => "TR",
            Country::UAE => "UAE",
            Country::UK => "UK",
            Country::US => "US",
            Country::ALL => "ALL",
        }
    }

    /// Language/context hint shown to the model next to each code.
    fn describe(self) -> &'static str {
        match self {
            Country::AU => "Australia - English",
            Country::BR => "Brazil - Portuguese",
            Country::CA => "Canada - English/French",
            Country::CN => "China - Chinese",
            Country::DE => "Germany - German",
            Country::ES => "Spain - Spanish",
            Country::FR => "France - French",
            Country::IN => "India - English/Hindi",
            Country::IT => "Italy - Italian",
            Country::JP => "Japan - Japanese",
            Country::MX => "Mexico - Spanish",
            Country::NL => "Netherlands - Dutch",
            Country::PL => "Poland - Polish",
            Country::RU => "Russia - Russian",
            Country::SA => "Saudi Arabia - Arabic",
            Country::SE => "Sweden - Swedish",
            Country::TR => "Turkey - Turkish",
            Country::UAE => "United Arab Emirates - Arabic/English",
            Country::UK => "United Kingdom - English",
            Country::US => "United States - English",
            Country::ALL => "Global/Universal terms",
        }
    }

    /// Tolerant parse: any case, `GB` as an alias of `UK`, and the
    /// `all`/`global` spellings for the `ALL` bucket.
    fn from_loose(value: &str) -> Option<Country> {
        match value.trim().to_uppercase().as_str() {
            "AU" => Some(Country::AU),
            "BR" => Some(Country::BR),
            "CA" => Some(Country::CA),
            "CN" => Some(Country::CN),
            "DE" => Some(Country::DE),
            "ES" => Some(Country::ES),
            "FR" => Some(Country::FR),
            "IN" => Some(Country::IN),
            "IT" => Some(Country::IT),
            "JP" => Some(Country::JP),
            "MX" => Some(Country::MX),
            "NL" => Some(Country::NL),
            "PL" => Some(Country::PL),
            "RU" => Some(Country::RU),
            "SA" => Some(Country::SA),
            "SE" => Some(Country::SE),
            "TR" => Some(Country::TR),
            "UAE" => Some(Country::UAE),
            "UK" | "GB" => Some(Country::UK),
            "US" => Some(Country::US),
            "ALL" | "GLOBAL" => Some(Country::ALL),
            _ => None,
        }
    }
}

impl fmt::Display for Country {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One cleaned input row. `country` is `Some` only when the source data
/// carried a code we recognize; everything else goes to the classifier.
#[derive(Debug, Clone, PartialEq)]
struct KeywordRecord {
    keyword: String,
    reason_to_flag: Option<String>,
    country: Option<Country>,
    valid_country_codes: Vec<String>,
    country_name: Option<String>,
    compliance_region: Option<String>,
}

/// Final per-keyword verdict. The client guarantees exactly one of these
/// per submitted keyword, fallback included.
#[derive(Debug, Clone, PartialEq)]
struct ClassificationResult {
    keyword: String,
    countries: Vec<Country>,
    rationale: Option<String>,
}

// ================================
// Schema: what we want the model to return (STRICT)
// ================================

/// One per-keyword assignment as returned by the model.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
struct KeywordAssignment {
    /// The keyword, echoed exactly as submitted
    keyword: String,
    /// One or more taxonomy country codes; ALL marks global terms
    country_codes: Vec<Country>,
    /// Short reasoning for the assignment
    rationale: String,
}

/// The full response for one batch.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
struct AssignmentBatch {
    assignments: Vec<KeywordAssignment>,
}

// ================================
// JSON Schema utilities
// ================================

/// Schema for `AssignmentBatch`, post-processed to what the structured
/// output endpoint demands: `$ref`s inlined, `additionalProperties: false`
/// on every object, all properties required.
fn assignment_batch_schema() -> Value {
    let schema = schema_for!(AssignmentBatch);
    let mut value = serde_json::to_value(schema).unwrap_or_default();
    inline_definitions(&mut value);
    enforce_strict_objects(&mut value);
    if let Value::Object(map) = &mut value {
        map.remove("$schema");
        map.remove("definitions");
    }
    value
}

fn enforce_strict_objects(value: &mut Value) {
    match value {
        Value::Object(map) => {
            let is_object = map.get("type").and_then(|t| t.as_str()) == Some("object")
                || map.contains_key("properties");
            if is_object {
                map.insert("additionalProperties".to_string(), Value::Bool(false));
                if let Some(Value::Object(props)) = map.get("properties") {
                    let keys: Vec<Value> =
                        props.keys().map(|k| Value::String(k.clone())).collect();
                    map.insert("required".to_string(), Value::Array(keys));
                }
            }
            for (_k, v) in map.iter_mut() {
                enforce_strict_objects(v);
            }
        }
        Value::Array(arr) => {
            for v in arr.iter_mut() {
                enforce_strict_objects(v);
            }
        }
        _ => {}
    }
}

fn inline_definitions(value: &mut Value) {
    let definitions = value.get("definitions").cloned();
    if let Some(defs) = definitions {
        inline_refs(value, &defs);
    }
}

fn inline_refs(value: &mut Value, definitions: &Value) {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(ref_path)) = map.get("$ref").cloned() {
                if let Some(name) = ref_path.strip_prefix("#/definitions/") {
                    if let Some(resolved) = definitions.get(name) {
                        let mut resolved = resolved.clone();
                        inline_refs(&mut resolved, definitions);
                        *value = resolved;
                        return;
                    }
                }
            }
            for (_k, v) in map.iter_mut() {
                inline_refs(v, definitions);
            }
        }
        Value::Array(arr) => {
            for v in arr.iter_mut() {
                inline_refs(v, definitions);
            }
        }
        _ => {}
    }
}

// ================================
// Record loading
// ================================

#[derive(Debug)]
struct LoadedRecords {
    preassigned: Vec<KeywordRecord>,
    pending: Vec<KeywordRecord>,
}

#[derive(Debug)]
struct ColumnMap {
    keyword: usize,
    reason: Option<usize>,
    code: Option<usize>,
    candidates: Option<usize>,
    name: Option<usize>,
    region: Option<usize>,
}

/// Header names are matched after trimming, lowercasing, and removing
/// internal spaces, so `Keyword`, `country_code`, `valid_country_code` and
/// even `Compliance _Region` (seen in real exports) all resolve.
fn normalize_header(raw: &str) -> String {
    raw.trim().to_lowercase().replace(' ', "").replace('-', "_")
}

fn resolve_columns(headers: &csv::StringRecord) -> Result<ColumnMap, PipelineError> {
    let mut keyword = None;
    let mut reason = None;
    let mut code = None;
    let mut candidates = None;
    let mut name = None;
    let mut region = None;

    for (idx, raw) in headers.iter().enumerate() {
        match normalize_header(raw).as_str() {
            "keyword" => keyword = keyword.or(Some(idx)),
            "reason_to_flag" | "reason" => reason = reason.or(Some(idx)),
            "country_code" | "valid_country_code" => code = code.or(Some(idx)),
            "valid_country_codes" => candidates = candidates.or(Some(idx)),
            "country" => name = name.or(Some(idx)),
            "compliance_region" => region = region.or(Some(idx)),
            _ => {} // unrecognized columns are ignored
        }
    }

    let keyword = keyword.ok_or_else(|| {
        PipelineError::InputFormat("missing required 'keyword' column".to_string())
    })?;
    Ok(ColumnMap {
        keyword,
        reason,
        code,
        candidates,
        name,
        region,
    })
}

/// Missing-value sentinels from spreadsheet exports normalize to `None`
/// here and never leak downstream.
fn non_sentinel(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.to_lowercase().as_str() {
        "nan" | "null" | "none" | "n/a" => None,
        _ => Some(trimmed.to_string()),
    }
}

/// Parse the input CSV into two disjoint record lists: rows that already
/// carry a recognized country code, and rows that need classification.
fn load_records(csv_text: &str) -> Result<LoadedRecords, PipelineError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(csv_text.as_bytes());

    let headers = reader
        .headers()
        .map_err(|e| PipelineError::InputFormat(format!("unreadable CSV header: {e}")))?
        .clone();
    let cols = resolve_columns(&headers)?;

    let mut preassigned = Vec::new();
    let mut pending = Vec::new();
    let mut dropped = 0usize;

    for (row, result) in reader.records().enumerate() {
        let line = row + 2; // 1-based, after the header row
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                warn!("Skipping unreadable row {line}: {e}");
                continue;
            }
        };

        let keyword = record.get(cols.keyword).unwrap_or("").trim();
        if keyword.is_empty() {
            dropped += 1;
            continue;
        }

        let field = |idx: Option<usize>| idx.and_then(|i| record.get(i)).and_then(non_sentinel);

        let country = match field(cols.code) {
            None => None,
            Some(code) => match Country::from_loose(&code) {
                Some(c) => Some(c),
                None => {
                    warn!(
                        "Row {line}: unrecognized country code '{code}' for '{keyword}', queued for classification"
                    );
                    None
                }
            },
        };

        let rec = KeywordRecord {
            keyword: keyword.to_string(),
            reason_to_flag: field(cols.reason),
            country,
            valid_country_codes: field(cols.candidates)
                .map(|s| {
                    s.split(',')
                        .map(str::trim)
                        .filter(|p| !p.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            country_name: field(cols.name),
            compliance_region: field(cols.region),
        };

        if rec.country.is_some() {
            preassigned.push(rec);
        } else {
            pending.push(rec);
        }
    }

    if dropped > 0 {
        info!("🧹 Dropped {dropped} rows with empty keywords");
    }
    if preassigned.is_empty() && pending.is_empty() {
        return Err(PipelineError::NoRecords);
    }
    Ok(LoadedRecords {
        preassigned,
        pending,
    })
}

// ================================
// Batching
// ================================

/// Pure partition of pending records into classification batches. The
/// final batch may be shorter, never empty.
fn batch_records(records: &[KeywordRecord], batch_size: usize) -> Vec<Vec<KeywordRecord>> {
    records
        .chunks(batch_size.max(1))
        .map(|chunk| chunk.to_vec())
        .collect()
}

// ================================
// Prompt construction
// ================================

const SYSTEM_PROMPT: &str = "You are a linguistics and regulatory expert specializing in \
    keyword categorization by country/region. You ONLY return JSON in the requested format.";

const DEFAULT_INSTRUCTIONS: &str = "\
You are classifying flagged advertising keywords by the country or region where they are \
most likely to be used.

Consider:
1. The language of the keyword
2. Cultural and regulatory context (e.g., FDA vs EMA terminology)
3. Region-specific marketing phrasing
4. Chemical names and medical terms (often universal)
5. Slang or colloquial spellings
6. Currency symbols or units of measurement";

/// Build the single prompt for one batch: instructions, the numbered
/// keyword list with whatever metadata survived loading, the taxonomy,
/// and the expected response shape.
fn build_batch_prompt(instructions: &str, batch: &[KeywordRecord]) -> String {
    let mut prompt = String::with_capacity(1024);
    prompt.push_str(instructions);
    prompt.push_str("\n\nKeywords to classify:\n\n");

    for (i, rec) in batch.iter().enumerate() {
        prompt.push_str(&format!("{}. Keyword: {}\n", i + 1, rec.keyword));
        if let Some(reason) = &rec.reason_to_flag {
            prompt.push_str(&format!("   Reason: {reason}\n"));
        }
        if !rec.valid_country_codes.is_empty() {
            prompt.push_str(&format!(
                "   Candidate country codes: {}\n",
                rec.valid_country_codes.join(", ")
            ));
        }
        if let Some(name) = &rec.country_name {
            prompt.push_str(&format!("   Country: {name}\n"));
        }
        if let Some(region) = &rec.compliance_region {
            prompt.push_str(&format!("   Compliance region: {region}\n"));
        }
        prompt.push('\n');
    }

    prompt.push_str("Country codes to choose from:\n");
    for country in Country::TAXONOMY {
        prompt.push_str(&format!("- {} ({})\n", country, country.describe()));
    }

    prompt.push_str(
        "\nRespond with JSON in the following format:\n\
        {\n\
          \"assignments\": [\n\
            {\"keyword\": \"keyword1\", \"country_codes\": [\"US\"], \"rationale\": \"short reason\"},\n\
            {\"keyword\": \"keyword2\", \"country_codes\": [\"DE\"], \"rationale\": \"short reason\"}\n\
          ]\n\
        }\n\
        Include every keyword exactly once, echoed exactly as given. \
        Use ALL for keywords that apply globally.",
    );
    prompt
}

// ================================
// Classifier client
// ================================

const OPENAI_API_URL: &str = "https://api.openai.com/v1";

const FALLBACK_RATIONALE: &str = "classification unavailable";

/// A provider of batch keyword classification.
///
/// Implementations must return exactly one result per submitted keyword and
/// may only fail with errors that should abort the whole run (auth,
/// configuration). Transient trouble is absorbed internally.
#[async_trait]
trait Classifier: Send + Sync {
    async fn classify(
        &self,
        batch: &[KeywordRecord],
    ) -> Result<Vec<ClassificationResult>, PipelineError>;
}

/// Typed outcome of a single call attempt, so retry is explicit control
/// flow instead of catch-and-loop.
enum CallOutcome<T> {
    Success(T),
    Retryable(String),
    Fatal(PipelineError),
}

/// Bounded retry with multiplicative backoff (750ms, x1.75, capped at 5s).
async fn retry_with_backoff<T, F, Fut>(
    label: &str,
    max_attempts: usize,
    mut run: F,
) -> Result<T, PipelineError>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = CallOutcome<T>>,
{
    let max_attempts = max_attempts.max(1);
    let mut delay_ms = 750u64;
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        match run(attempt).await {
            CallOutcome::Success(value) => return Ok(value),
            CallOutcome::Fatal(err) => {
                error!("❌ [{label}] Fatal error on attempt {attempt}: {err}");
                return Err(err);
            }
            CallOutcome::Retryable(msg) => {
                warn!("⚠️  [{label}] Attempt {attempt}/{max_attempts} failed: {msg}");
                last_error = msg;
                if attempt < max_attempts {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    delay_ms = (delay_ms as f64 * 1.75).min(5000.0) as u64;
                }
            }
        }
    }
    Err(PipelineError::TransientApi(format!(
        "{label} gave up after {max_attempts} attempts: {last_error}"
    )))
}

/// Every keyword in the batch goes to the fallback bucket. Applied when
/// both response modes are exhausted, so no submitted keyword is dropped.
fn fallback_batch(batch: &[KeywordRecord], fallback: Country) -> Vec<ClassificationResult> {
    batch
        .iter()
        .map(|rec| ClassificationResult {
            keyword: rec.keyword.clone(),
            countries: vec![fallback],
            rationale: Some(FALLBACK_RATIONALE.to_string()),
        })
        .collect()
}

fn dedup_countries(list: &[Country]) -> Vec<Country> {
    let mut out = Vec::with_capacity(list.len());
    for c in list {
        if !out.contains(c) {
            out.push(*c);
        }
    }
    out
}

fn snippet(text: &str) -> String {
    text.chars().take(300).collect()
}

// ================================
// Output parsing (model -> our types)
// ================================

/// Dig the JSON payload out of whichever envelope the API returned:
/// Responses API `output[]`/`output_text`, or Chat Completions
/// `choices[0].message.content`.
fn extract_json_payload(val: &Value) -> Result<Value, PipelineError> {
    if let Some(arr) = val.get("output").and_then(|o| o.as_array()) {
        for item in arr {
            if let Some(contents) = item.get("content").and_then(|c| c.as_array()) {
                for c in contents {
                    if c.get("type").and_then(|t| t.as_str()) == Some("output_text") {
                        if let Some(text) = c.get("text").and_then(|t| t.as_str()) {
                            return parse_json_text(text);
                        }
                    }
                }
            }
        }
    }

    // Some SDKs return the structured JSON directly under `output`.
    if let Some(output) = val.get("output") {
        if output.is_object() {
            return Ok(output.clone());
        }
    }

    if let Some(text) = val.get("output_text").and_then(|t| t.as_str()) {
        return parse_json_text(text);
    }

    if let Some(text) = val
        .pointer("/choices/0/message/content")
        .and_then(|t| t.as_str())
    {
        return parse_json_text(text);
    }

    if let Some(text) = val.pointer("/content/0/text").and_then(|t| t.as_str()) {
        return parse_json_text(text);
    }

    Err(PipelineError::SchemaValidation(
        "no JSON payload found in model response".to_string(),
    ))
}

/// Models occasionally wrap the JSON in prose or markdown fences; fall
/// back to the outermost brace pair before giving up.
fn parse_json_text(text: &str) -> Result<Value, PipelineError> {
    if let Ok(v) = serde_json::from_str(text) {
        return Ok(v);
    }
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            if let Ok(v) = serde_json::from_str(&text[start..=end]) {
                return Ok(v);
            }
        }
    }
    Err(PipelineError::SchemaValidation(format!(
        "model text is not valid JSON: {}",
        snippet(text)
    )))
}

/// Two-tier response parsing: the strict tier demands schema-exact output,
/// the lenient tier coerces whatever JSON the model produced.
trait ResponseParser {
    fn parse(
        &self,
        payload: &Value,
        batch: &[KeywordRecord],
    ) -> Result<Vec<ClassificationResult>, PipelineError>;
}

/// Accepts only a schema-valid `AssignmentBatch` covering every submitted
/// keyword exactly once. Anything else is a validation failure.
struct StrictParser;

impl ResponseParser for StrictParser {
    fn parse(
        &self,
        payload: &Value,
        batch: &[KeywordRecord],
    ) -> Result<Vec<ClassificationResult>, PipelineError> {
        let parsed: AssignmentBatch = serde_json::from_value(payload.clone()).map_err(|e| {
            PipelineError::SchemaValidation(format!("response does not match assignment schema: {e}"))
        })?;

        let submitted: HashSet<&str> = batch.iter().map(|r| r.keyword.as_str()).collect();
        let mut by_keyword: HashMap<&str, &KeywordAssignment> = HashMap::new();
        for assignment in &parsed.assignments {
            if !submitted.contains(assignment.keyword.as_str()) {
                return Err(PipelineError::SchemaValidation(format!(
                    "model invented keyword '{}'",
                    assignment.keyword
                )));
            }
            if assignment.country_codes.is_empty() {
                return Err(PipelineError::SchemaValidation(format!(
                    "empty country list for '{}'",
                    assignment.keyword
                )));
            }
            if by_keyword
                .insert(assignment.keyword.as_str(), assignment)
                .is_some()
            {
                return Err(PipelineError::SchemaValidation(format!(
                    "duplicate assignment for '{}'",
                    assignment.keyword
                )));
            }
        }

        batch
            .iter()
            .map(|record| {
                let assignment = by_keyword.get(record.keyword.as_str()).ok_or_else(|| {
                    PipelineError::SchemaValidation(format!(
                        "no assignment returned for '{}'",
                        record.keyword
                    ))
                })?;
                Ok(ClassificationResult {
                    keyword: record.keyword.clone(),
                    countries: dedup_countries(&assignment.country_codes),
                    rationale: if assignment.rationale.trim().is_empty() {
                        None
                    } else {
                        Some(assignment.rationale.clone())
                    },
                })
            })
            .collect()
    }
}

const LENIENT_LIST_KEYS: [&str; 5] = [
    "assignments",
    "classifications",
    "analyses",
    "results",
    "keywords",
];

/// Coerces free-form JSON into results: the structured shape with sloppy
/// fields, a bare array of items, or a flat `{keyword: code}` map.
/// Invented keywords are discarded; submitted keywords the model skipped
/// get the fallback assignment so coverage stays total.
struct LenientParser {
    fallback: Country,
}

fn parse_codes_value(value: &Value) -> Vec<Country> {
    let mut out = Vec::new();
    match value {
        Value::String(s) => {
            for part in s.split(',') {
                if let Some(c) = Country::from_loose(part) {
                    if !out.contains(&c) {
                        out.push(c);
                    }
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                if let Some(s) = item.as_str() {
                    if let Some(c) = Country::from_loose(s) {
                        if !out.contains(&c) {
                            out.push(c);
                        }
                    }
                }
            }
        }
        _ => {}
    }
    out
}

fn lenient_item(item: &Value) -> Option<(String, Vec<Country>, Option<String>)> {
    let obj = item.as_object()?;
    let keyword = obj.get("keyword").and_then(|v| v.as_str())?.trim().to_string();
    let codes = ["country_codes", "countries", "country_code", "country"]
        .iter()
        .find_map(|k| obj.get(*k))
        .map(parse_codes_value)
        .unwrap_or_default();
    let rationale = ["rationale", "analysis", "reason"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(|v| v.as_str()))
        .map(|s| s.to_string());
    Some((keyword, codes, rationale))
}

impl ResponseParser for LenientParser {
    fn parse(
        &self,
        payload: &Value,
        batch: &[KeywordRecord],
    ) -> Result<Vec<ClassificationResult>, PipelineError> {
        let canonical: HashMap<String, String> = batch
            .iter()
            .map(|r| (r.keyword.to_lowercase(), r.keyword.clone()))
            .collect();

        let mut items: Vec<(String, Vec<Country>, Option<String>)> = Vec::new();
        match payload {
            Value::Object(obj) => {
                if let Some(arr) = LENIENT_LIST_KEYS
                    .iter()
                    .find_map(|k| obj.get(*k).and_then(|v| v.as_array()))
                {
                    for item in arr {
                        if let Some(parsed) = lenient_item(item) {
                            items.push(parsed);
                        }
                    }
                } else {
                    for (k, v) in obj {
                        items.push((k.trim().to_string(), parse_codes_value(v), None));
                    }
                }
            }
            Value::Array(arr) => {
                for item in arr {
                    if let Some(parsed) = lenient_item(item) {
                        items.push(parsed);
                    }
                }
            }
            _ => {
                return Err(PipelineError::SchemaValidation(
                    "JSON-mode payload is neither object nor array".to_string(),
                ))
            }
        }

        let mut collected: HashMap<String, ClassificationResult> = HashMap::new();
        for (keyword, countries, rationale) in items {
            if countries.is_empty() {
                continue;
            }
            let Some(original) = canonical.get(&keyword.to_lowercase()) else {
                debug!("Discarding invented keyword '{keyword}' from model response");
                continue;
            };
            collected.entry(original.clone()).or_insert(ClassificationResult {
                keyword: original.clone(),
                countries,
                rationale,
            });
        }

        Ok(batch
            .iter()
            .map(|record| {
                collected.remove(&record.keyword).unwrap_or_else(|| ClassificationResult {
                    keyword: record.keyword.clone(),
                    countries: vec![self.fallback],
                    rationale: Some(FALLBACK_RATIONALE.to_string()),
                })
            })
            .collect())
    }
}

// ================================
/* OpenAI classifier (Structured Outputs via Responses API)
   We enforce our JSON Schema so the model MUST return schema-valid JSON.
   If structured mode exhausts its retries, we drop to plain JSON mode on
   Chat Completions and parse leniently. If that fails too, the whole
   batch goes to the fallback bucket. */
// ================================

#[derive(Debug, Default)]
struct CallStats {
    api_calls: AtomicUsize,
    retries: AtomicUsize,
    json_mode_fallbacks: AtomicUsize,
    default_fallbacks: AtomicUsize,
}

#[derive(Debug, Clone, Copy)]
struct StatsSnapshot {
    api_calls: usize,
    retries: usize,
    json_mode_fallbacks: usize,
    default_fallbacks: usize,
}

struct OpenAiClassifier {
    http: Client,
    api_key: String,
    model: String,
    base_url: String,
    temperature: f32,
    max_retries: usize,
    instructions: String,
    fallback: Country,
    schema: Value,
    stats: CallStats,
}

impl OpenAiClassifier {
    fn new(cfg: &Config, api_key: String, instructions: String) -> Result<Self> {
        let http = Client::builder()
            .gzip(true)
            .connect_timeout(Duration::from_secs(15))
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .context("HTTP client build failed")?;
        Ok(Self {
            http,
            api_key,
            model: cfg.model.clone(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            temperature: cfg.temperature,
            max_retries: cfg.max_retries,
            instructions,
            fallback: cfg.fallback,
            schema: assignment_batch_schema(),
            stats: CallStats::default(),
        })
    }

    fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            api_calls: self.stats.api_calls.load(Ordering::Relaxed),
            retries: self.stats.retries.load(Ordering::Relaxed),
            json_mode_fallbacks: self.stats.json_mode_fallbacks.load(Ordering::Relaxed),
            default_fallbacks: self.stats.default_fallbacks.load(Ordering::Relaxed),
        }
    }

    fn count_call(&self, attempt: usize) {
        self.stats.api_calls.fetch_add(1, Ordering::Relaxed);
        if attempt > 1 {
            self.stats.retries.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn structured_body(&self, prompt: &str) -> Value {
        json!({
            "model": self.model,
            "input": [
              {
                "role": "system",
                "content": [{ "type": "input_text", "text": SYSTEM_PROMPT }]
              },
              {
                "role": "user",
                "content": [{ "type": "input_text", "text": prompt }]
              }
            ],
            "temperature": self.temperature,
            "text": {
              "format": {
                "type": "json_schema",
                "name": "keyword_assignments",
                "schema": self.schema,
                "strict": true
              }
            }
        })
    }

    fn json_mode_body(&self, prompt: &str) -> Value {
        json!({
            "model": self.model,
            "messages": [
              { "role": "system", "content": SYSTEM_PROMPT },
              { "role": "user", "content": prompt }
            ],
            "temperature": self.temperature,
            "response_format": { "type": "json_object" }
        })
    }

    /// One HTTP POST, classified into the typed outcome: auth failures are
    /// fatal, everything else transient.
    async fn attempt_call(&self, url: &str, body: &Value) -> CallOutcome<Value> {
        let started = Instant::now();
        let resp = match self
            .http
            .post(url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return CallOutcome::Retryable(format!("HTTP send failed: {e}")),
        };

        let status = resp.status();
        let body_text = match resp.text().await {
            Ok(t) => t,
            Err(e) => return CallOutcome::Retryable(format!("HTTP body read failed: {e}")),
        };
        let elapsed = started.elapsed();

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return CallOutcome::Fatal(PipelineError::PermanentApi(format!(
                "HTTP {status}: {}",
                snippet(&body_text)
            )));
        }
        if !status.is_success() {
            return CallOutcome::Retryable(format!(
                "HTTP {status} ({}ms): {}",
                elapsed.as_millis(),
                snippet(&body_text)
            ));
        }

        match serde_json::from_str::<Value>(&body_text) {
            Ok(v) => {
                info!("✅ [OpenAI] Response OK ({}ms)", elapsed.as_millis());
                CallOutcome::Success(v)
            }
            Err(e) => CallOutcome::Retryable(format!("response decode failed: {e}")),
        }
    }

    async fn structured_attempt(
        &self,
        attempt: usize,
        body: &Value,
        batch: &[KeywordRecord],
    ) -> CallOutcome<Vec<ClassificationResult>> {
        self.count_call(attempt);
        info!(
            "➡️  [OpenAI] Structured request for {} keywords (attempt {attempt})",
            batch.len()
        );
        let url = format!("{}/responses", self.base_url);
        let raw = match self.attempt_call(&url, body).await {
            CallOutcome::Success(v) => v,
            CallOutcome::Retryable(msg) => return CallOutcome::Retryable(msg),
            CallOutcome::Fatal(err) => return CallOutcome::Fatal(err),
        };
        match extract_json_payload(&raw).and_then(|p| StrictParser.parse(&p, batch)) {
            Ok(results) => CallOutcome::Success(results),
            Err(e) => CallOutcome::Retryable(format!("structured response rejected: {e}")),
        }
    }

    async fn json_mode_attempt(
        &self,
        attempt: usize,
        body: &Value,
        batch: &[KeywordRecord],
    ) -> CallOutcome<Vec<ClassificationResult>> {
        self.count_call(attempt);
        info!(
            "➡️  [OpenAI] JSON-mode request for {} keywords (attempt {attempt})",
            batch.len()
        );
        let url = format!("{}/chat/completions", self.base_url);
        let raw = match self.attempt_call(&url, body).await {
            CallOutcome::Success(v) => v,
            CallOutcome::Retryable(msg) => return CallOutcome::Retryable(msg),
            CallOutcome::Fatal(err) => return CallOutcome::Fatal(err),
        };
        let parser = LenientParser {
            fallback: self.fallback,
        };
        match extract_json_payload(&raw).and_then(|p| parser.parse(&p, batch)) {
            Ok(results) => CallOutcome::Success(results),
            Err(e) => CallOutcome::Retryable(format!("JSON-mode response rejected: {e}")),
        }
    }

    async fn classify_batch(
        &self,
        batch: &[KeywordRecord],
    ) -> Result<Vec<ClassificationResult>, PipelineError> {
        let prompt = build_batch_prompt(&self.instructions, batch);

        let structured_body = self.structured_body(&prompt);
        match retry_with_backoff("structured", self.max_retries, |attempt| {
            self.structured_attempt(attempt, &structured_body, batch)
        })
        .await
        {
            Ok(results) => return Ok(results),
            Err(err @ PipelineError::PermanentApi(_)) => return Err(err),
            Err(err) => warn!(
                "⚠️  Structured mode failed for batch of {}: {err}; trying raw JSON mode",
                batch.len()
            ),
        }

        self.stats.json_mode_fallbacks.fetch_add(1, Ordering::Relaxed);
        let raw_body = self.json_mode_body(&prompt);
        match retry_with_backoff("json-mode", self.max_retries, |attempt| {
            self.json_mode_attempt(attempt, &raw_body, batch)
        })
        .await
        {
            Ok(results) => return Ok(results),
            Err(err @ PipelineError::PermanentApi(_)) => return Err(err),
            Err(err) => warn!(
                "⚠️  Raw JSON mode failed for batch of {}: {err}; applying fallback assignment",
                batch.len()
            ),
        }

        self.stats
            .default_fallbacks
            .fetch_add(batch.len(), Ordering::Relaxed);
        Ok(fallback_batch(batch, self.fallback))
    }
}

#[async_trait]
impl Classifier for OpenAiClassifier {
    async fn classify(
        &self,
        batch: &[KeywordRecord],
    ) -> Result<Vec<ClassificationResult>, PipelineError> {
        self.classify_batch(batch).await
    }
}

// ================================
// Merging
// ================================

/// Country -> keyword buckets with set semantics. Only the merge stage
/// holds a mutable reference; workers hand their results over instead of
/// touching shared state.
#[derive(Debug, Default)]
struct CountryKeywordIndex {
    buckets: BTreeMap<Country, BTreeSet<String>>,
}

impl CountryKeywordIndex {
    fn new() -> Self {
        Self::default()
    }

    /// Idempotent set-union insert. Blank keywords are filtered, not an
    /// error.
    fn insert(&mut self, country: Country, keyword: &str) {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            return;
        }
        self.buckets
            .entry(country)
            .or_default()
            .insert(keyword.to_string());
    }

    fn absorb_preassigned(&mut self, records: &[KeywordRecord]) {
        for record in records {
            if let Some(country) = record.country {
                self.insert(country, &record.keyword);
            }
        }
    }

    fn absorb_results(&mut self, results: &[ClassificationResult]) {
        for result in results {
            for country in &result.countries {
                self.insert(*country, &result.keyword);
            }
        }
    }

    /// Freeze into the output shape: each bucket deduplicated and sorted
    /// case-insensitively (original casing breaks ties, so reruns are
    /// byte-identical).
    fn freeze(self) -> FrozenIndex {
        let buckets = self
            .buckets
            .into_iter()
            .map(|(country, set)| {
                let mut keywords: Vec<String> = set.into_iter().collect();
                keywords.sort_by(|a, b| {
                    a.to_lowercase()
                        .cmp(&b.to_lowercase())
                        .then_with(|| a.cmp(b))
                });
                (country, keywords)
            })
            .collect();
        FrozenIndex { buckets }
    }
}

#[derive(Debug, PartialEq)]
struct FrozenIndex {
    buckets: BTreeMap<Country, Vec<String>>,
}

impl FrozenIndex {
    fn to_json_string(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.buckets)
    }

    fn total_keywords(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }
}

// ================================
// Output writers
// ================================

fn write_err(path: &Path, err: impl fmt::Display) -> PipelineError {
    PipelineError::Write(format!("{}: {err}", path.display()))
}

fn write_json(frozen: &FrozenIndex, path: &Path) -> Result<(), PipelineError> {
    info!("🧾 Writing JSON index: {}", path.display());
    let body = frozen.to_json_string().map_err(|e| write_err(path, e))?;
    fs::write(path, body + "\n").map_err(|e| write_err(path, e))
}

/// One row per (keyword, country) assignment, with the original metadata
/// and the classifier's rationale joined back in.
fn write_detail_csv(
    frozen: &FrozenIndex,
    loaded: &LoadedRecords,
    results: &[ClassificationResult],
    path: &Path,
) -> Result<(), PipelineError> {
    info!("💾 Writing detail CSV: {}", path.display());

    let mut meta: HashMap<&str, &KeywordRecord> = HashMap::new();
    for rec in loaded.preassigned.iter().chain(loaded.pending.iter()) {
        meta.entry(rec.keyword.as_str()).or_insert(rec);
    }
    let mut rationales: HashMap<&str, &str> = HashMap::new();
    for result in results {
        if let Some(text) = &result.rationale {
            rationales.entry(result.keyword.as_str()).or_insert(text.as_str());
        }
    }

    let mut writer = csv::Writer::from_path(path).map_err(|e| write_err(path, e))?;
    writer
        .write_record([
            "Keyword",
            "Country_Code",
            "Reason_to_Flag",
            "Compliance_Region",
            "Analysis",
        ])
        .map_err(|e| write_err(path, e))?;

    for (country, keywords) in &frozen.buckets {
        for keyword in keywords {
            let rec = meta.get(keyword.as_str());
            writer
                .write_record([
                    keyword.as_str(),
                    country.as_str(),
                    rec.and_then(|r| r.reason_to_flag.as_deref()).unwrap_or(""),
                    rec.and_then(|r| r.compliance_region.as_deref()).unwrap_or(""),
                    rationales.get(keyword.as_str()).copied().unwrap_or(""),
                ])
                .map_err(|e| write_err(path, e))?;
        }
    }
    writer.flush().map_err(|e| write_err(path, e))
}

/// Write both outputs to temporary siblings, then rename into place, so a
/// failed run never leaves a half-written file looking complete.
fn write_outputs(
    frozen: &FrozenIndex,
    loaded: &LoadedRecords,
    results: &[ClassificationResult],
    out_dir: &Path,
) -> Result<(), PipelineError> {
    let json_path = out_dir.join("violation_patterns.json");
    let csv_path = out_dir.join("violation_patterns.csv");
    let json_tmp = out_dir.join("violation_patterns.json.tmp");
    let csv_tmp = out_dir.join("violation_patterns.csv.tmp");

    let outcome = write_json(frozen, &json_tmp)
        .and_then(|()| write_detail_csv(frozen, loaded, results, &csv_tmp))
        .and_then(|()| fs::rename(&json_tmp, &json_path).map_err(|e| write_err(&json_path, e)))
        .and_then(|()| fs::rename(&csv_tmp, &csv_path).map_err(|e| write_err(&csv_path, e)));

    match outcome {
        Ok(()) => {
            info!("📦 Outputs:");
            info!("  • JSON: {}", json_path.display());
            info!("  • CSV:  {}", csv_path.display());
            Ok(())
        }
        Err(err) => {
            let _ = fs::remove_file(&json_tmp);
            let _ = fs::remove_file(&csv_tmp);
            Err(err)
        }
    }
}

// ================================
// Pipeline driver
// ================================

/// Classify all pending records through a bounded worker pool. Batches run
/// in parallel; each worker drives its own retry ladder to completion. A
/// fatal error stops new dispatch but lets in-flight batches finish before
/// the run fails.
fn classify_pending<C: Classifier>(
    classifier: &C,
    pending: &[KeywordRecord],
    cfg: &Config,
) -> Result<Vec<ClassificationResult>> {
    if pending.is_empty() {
        info!("✨ No keywords need classification");
        return Ok(Vec::new());
    }

    let batches = batch_records(pending, cfg.batch_size);
    info!(
        "🪚 Split {} pending keywords into {} batches of up to {}",
        pending.len(),
        batches.len(),
        cfg.batch_size
    );

    let pb = ProgressBar::new(batches.len() as u64);
    pb.set_style(
        ProgressStyle::with_template("{spinner} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap()
            .progress_chars("=>-"),
    );
    pb.set_message("classifying…");

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(cfg.concurrency)
        .build()
        .context("Failed to build Rayon thread pool")?;

    let abort: OnceLock<PipelineError> = OnceLock::new();
    let batch_results: Vec<Vec<ClassificationResult>> = pool.install(|| {
        batches
            .par_iter()
            .filter_map(|batch| {
                if abort.get().is_some() {
                    // Fatal already observed; stop dispatching new batches.
                    pb.inc(1);
                    return None;
                }

                // BLOCK ON async call inside rayon worker:
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("tokio rt");
                let outcome = rt.block_on(classifier.classify(batch));
                pb.inc(1);

                match outcome {
                    Ok(results) => Some(results),
                    Err(err) => {
                        error!("❌ Batch of {} failed fatally: {err}", batch.len());
                        let _ = abort.set(err);
                        None
                    }
                }
            })
            .collect()
    });
    pb.finish_with_message("done");

    if let Some(err) = abort.into_inner() {
        return Err(err.into());
    }
    Ok(batch_results.into_iter().flatten().collect())
}

// ================================
// Main
// ================================

#[tokio::main]
async fn main() -> Result<()> {
    // ---- Logging setup ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    // ---- Resolve OpenAI API key ----
    dotenvy::dotenv().ok(); // loads variables from .env if present
    let api_key = std::env::var("OPENAI_API_KEY")
        .context("Missing OPENAI_API_KEY env var. Set it before running.")?;

    // ---- Read input CSV ----
    let csv_text = if cli.demo {
        info!("📄 Using built-in sample keyword list (embedded)");
        include_str!("../sample_keywords.csv").to_string()
    } else {
        let input_path = cli.input.as_ref().expect("input required unless --demo");
        info!("📄 Reading input file: {}", input_path.display());
        fs::read_to_string(input_path).context("Failed to read input CSV as UTF-8")?
    };

    // ---- Prepare config ----
    let fallback = Country::from_loose(&cli.fallback_country).ok_or_else(|| {
        anyhow!(
            "--fallback-country '{}' is not in the country taxonomy",
            cli.fallback_country
        )
    })?;
    let cfg = Config {
        model: cli.model,
        batch_size: cli.batch_size.max(1),
        max_retries: cli.max_retries.max(1),
        concurrency: cli.concurrency.max(1),
        temperature: cli.temperature,
        timeout_seconds: cli.timeout_seconds,
        out_dir: cli.out_dir,
        fallback,
        base_url: cli.base_url.unwrap_or_else(|| OPENAI_API_URL.to_string()),
    };

    fs::create_dir_all(&cfg.out_dir).context("Failed to create out-dir")?;

    info!("🧠 Model: {}", cfg.model);
    info!(
        "⚙️  BatchSize={}, MaxRetries={}, Concurrency={}, Fallback={}",
        cfg.batch_size, cfg.max_retries, cfg.concurrency, cfg.fallback
    );

    // ---- Load + split ----
    let loaded = load_records(&csv_text)?;
    info!(
        "📋 Loaded {} preassigned and {} pending keywords",
        loaded.preassigned.len(),
        loaded.pending.len()
    );

    // ---- Classification instructions ----
    let instructions = match &cli.prompt_file {
        Some(path) => fs::read_to_string(path).context("Failed to read prompt file as UTF-8")?,
        None => DEFAULT_INSTRUCTIONS.to_string(),
    };

    // ---- Classify pending keywords ----
    let classifier = OpenAiClassifier::new(&cfg, api_key, instructions)?;
    let results = classify_pending(&classifier, &loaded.pending, &cfg)?;

    let stats = classifier.stats();
    info!(
        "📊 {} API calls, {} retries, {} raw-JSON fallbacks, {} keywords defaulted to {}",
        stats.api_calls, stats.retries, stats.json_mode_fallbacks, stats.default_fallbacks, cfg.fallback
    );

    // ---- Merge + freeze ----
    let mut index = CountryKeywordIndex::new();
    index.absorb_preassigned(&loaded.preassigned);
    index.absorb_results(&results);
    let frozen = index.freeze();

    let covered: HashSet<&str> = frozen.buckets.values().flatten().map(String::as_str).collect();
    for rec in loaded.preassigned.iter().chain(loaded.pending.iter()) {
        if !covered.contains(rec.keyword.as_str()) {
            error!("❌ Keyword '{}' is missing from the output index", rec.keyword);
        }
    }

    // ---- Write outputs ----
    write_outputs(&frozen, &loaded, &results, &cfg.out_dir)?;

    info!(
        "🌍 {} keywords across {} country buckets:",
        frozen.total_keywords(),
        frozen.buckets.len()
    );
    for (country, keywords) in &frozen.buckets {
        info!("  {}: {} keywords", country, keywords.len());
    }
    info!("✅ All done.");
    Ok(())
}

// ================================
// Tests
// ================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(keyword: &str, country: Option<Country>) -> KeywordRecord {
        KeywordRecord {
            keyword: keyword.to_string(),
            reason_to_flag: None,
            country,
            valid_country_codes: Vec::new(),
            country_name: None,
            compliance_region: None,
        }
    }

    fn test_config() -> Config {
        Config {
            model: "gpt-4o".to_string(),
            batch_size: 10,
            max_retries: 3,
            concurrency: 2,
            temperature: 0.1,
            timeout_seconds: 30,
            out_dir: PathBuf::from("./out"),
            fallback: Country::ALL,
            base_url: OPENAI_API_URL.to_string(),
        }
    }

    fn block_on<F: Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("tokio rt")
            .block_on(fut)
    }

    /// Answers from a fixed table; anything unknown goes to ALL.
    struct MockClassifier {
        assignments: HashMap<String, Vec<Country>>,
        calls: AtomicUsize,
    }

    impl MockClassifier {
        fn new(assignments: &[(&str, &[Country])]) -> Self {
            Self {
                assignments: assignments
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_vec()))
                    .collect(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Classifier for MockClassifier {
        async fn classify(
            &self,
            batch: &[KeywordRecord],
        ) -> Result<Vec<ClassificationResult>, PipelineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(batch
                .iter()
                .map(|rec| ClassificationResult {
                    keyword: rec.keyword.clone(),
                    countries: self
                        .assignments
                        .get(&rec.keyword)
                        .cloned()
                        .unwrap_or_else(|| vec![Country::ALL]),
                    rationale: None,
                })
                .collect())
        }
    }

    struct BrokenAuthClassifier;

    #[async_trait]
    impl Classifier for BrokenAuthClassifier {
        async fn classify(
            &self,
            _batch: &[KeywordRecord],
        ) -> Result<Vec<ClassificationResult>, PipelineError> {
            Err(PipelineError::PermanentApi("HTTP 401".to_string()))
        }
    }

    // ---- Record loading ----

    #[test]
    fn loader_splits_preassigned_and_pending() {
        let csv_text = "Keyword,Reason_to_Flag,Country_Code\n\
                        free shipping,Promo claim,US\n\
                        kostenlos,Promo claim,\n\
                        gratuit,Promo claim,nan\n";
        let loaded = load_records(csv_text).unwrap();
        assert_eq!(loaded.preassigned.len(), 1);
        assert_eq!(loaded.preassigned[0].keyword, "free shipping");
        assert_eq!(loaded.preassigned[0].country, Some(Country::US));
        let pending: Vec<&str> = loaded.pending.iter().map(|r| r.keyword.as_str()).collect();
        assert_eq!(pending, vec!["kostenlos", "gratuit"]);
        assert!(loaded.pending.iter().all(|r| r.country.is_none()));
    }

    #[test]
    fn loader_resolves_header_variants() {
        let loaded = load_records("keyword,valid_country_code\ndetox tea,uk\n").unwrap();
        assert_eq!(loaded.preassigned[0].country, Some(Country::UK));

        // Stray space inside the header, as seen in real exports.
        let loaded =
            load_records("Keyword,Compliance _Region,country_code\nmiracle cure,FDA,US\n").unwrap();
        assert_eq!(
            loaded.preassigned[0].compliance_region.as_deref(),
            Some("FDA")
        );
    }

    #[test]
    fn loader_normalizes_all_sentinel_case_insensitively() {
        let csv_text = "keyword,country_code\n\
                        alpha,all\n\
                        beta,ALL\n\
                        gamma,Global\n";
        let loaded = load_records(csv_text).unwrap();
        assert_eq!(loaded.pending.len(), 0);
        assert!(loaded
            .preassigned
            .iter()
            .all(|r| r.country == Some(Country::ALL)));
    }

    #[test]
    fn loader_drops_empty_keywords() {
        let csv_text = "keyword,country_code\n\
                        ,US\n\
                        \"   \",DE\n\
                        real keyword,US\n";
        let loaded = load_records(csv_text).unwrap();
        assert_eq!(loaded.preassigned.len(), 1);
        assert_eq!(loaded.pending.len(), 0);
        assert_eq!(loaded.preassigned[0].keyword, "real keyword");
    }

    #[test]
    fn loader_routes_unknown_codes_to_pending() {
        let loaded = load_records("keyword,country_code\nmystery term,ZZ\n").unwrap();
        assert!(loaded.preassigned.is_empty());
        assert_eq!(loaded.pending[0].keyword, "mystery term");
    }

    #[test]
    fn loader_rejects_missing_keyword_column() {
        let err = load_records("name,country_code\nfoo,US\n").unwrap_err();
        assert!(matches!(err, PipelineError::InputFormat(_)));
    }

    #[test]
    fn loader_rejects_empty_input() {
        let err = load_records("keyword,country_code\n,\n  ,US\n").unwrap_err();
        assert!(matches!(err, PipelineError::NoRecords));
    }

    #[test]
    fn loader_splits_candidate_codes() {
        let loaded =
            load_records("keyword,Valid_Country_Codes\ngratis envío,\"ES, MX\"\n").unwrap();
        assert_eq!(loaded.pending[0].valid_country_codes, vec!["ES", "MX"]);
    }

    // ---- Batching ----

    #[test]
    fn batcher_partitions_with_short_tail() {
        let records: Vec<KeywordRecord> =
            (0..25).map(|i| record(&format!("kw{i}"), None)).collect();
        let batches = batch_records(&records, 10);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 10);
        assert_eq!(batches[2].len(), 5);
        assert!(batches.iter().all(|b| !b.is_empty()));
    }

    #[test]
    fn batcher_handles_empty_input() {
        assert!(batch_records(&[], 10).is_empty());
    }

    // ---- Country parsing ----

    #[test]
    fn country_parses_loosely() {
        assert_eq!(Country::from_loose("de"), Some(Country::DE));
        assert_eq!(Country::from_loose(" gb "), Some(Country::UK));
        assert_eq!(Country::from_loose("Global"), Some(Country::ALL));
        assert_eq!(Country::from_loose("uae"), Some(Country::UAE));
        assert_eq!(Country::from_loose("XX"), None);
    }

    // ---- Schema ----

    #[test]
    fn schema_is_inlined_and_strict() {
        let schema = assignment_batch_schema();
        let text = schema.to_string();
        assert!(!text.contains("$ref"));
        assert!(text.contains("additionalProperties"));
        assert!(text.contains("country_codes"));
    }

    // ---- Response parsing ----

    #[test]
    fn strict_parser_accepts_exact_coverage() {
        let batch = vec![record("kostenlos", None), record("gratuit", None)];
        let payload = json!({
            "assignments": [
                {"keyword": "kostenlos", "country_codes": ["DE"], "rationale": "German term"},
                {"keyword": "gratuit", "country_codes": ["FR", "CA"], "rationale": ""}
            ]
        });
        let results = StrictParser.parse(&payload, &batch).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].countries, vec![Country::DE]);
        assert_eq!(results[0].rationale.as_deref(), Some("German term"));
        assert_eq!(results[1].countries, vec![Country::FR, Country::CA]);
        assert_eq!(results[1].rationale, None);
    }

    #[test]
    fn strict_parser_rejects_invented_keyword() {
        let batch = vec![record("kostenlos", None)];
        let payload = json!({
            "assignments": [
                {"keyword": "kostenlos", "country_codes": ["DE"], "rationale": "x"},
                {"keyword": "hallucinated", "country_codes": ["US"], "rationale": "x"}
            ]
        });
        let err = StrictParser.parse(&payload, &batch).unwrap_err();
        assert!(matches!(err, PipelineError::SchemaValidation(_)));
    }

    #[test]
    fn strict_parser_rejects_missing_keyword() {
        let batch = vec![record("kostenlos", None), record("gratuit", None)];
        let payload = json!({
            "assignments": [
                {"keyword": "kostenlos", "country_codes": ["DE"], "rationale": "x"}
            ]
        });
        let err = StrictParser.parse(&payload, &batch).unwrap_err();
        assert!(matches!(err, PipelineError::SchemaValidation(_)));
    }

    #[test]
    fn lenient_parser_accepts_flat_map() {
        let batch = vec![record("kostenlos", None), record("gratuit", None)];
        let payload = json!({ "kostenlos": "DE", "gratuit": ["FR", "junk"] });
        let parser = LenientParser {
            fallback: Country::ALL,
        };
        let results = parser.parse(&payload, &batch).unwrap();
        assert_eq!(results[0].countries, vec![Country::DE]);
        assert_eq!(results[1].countries, vec![Country::FR]);
    }

    #[test]
    fn lenient_parser_discards_invented_and_fills_missing() {
        let batch = vec![record("kostenlos", None), record("gratuit", None)];
        let payload = json!({
            "assignments": [
                {"keyword": "Kostenlos", "country_codes": ["DE"], "rationale": "case differs"},
                {"keyword": "hallucinated", "country_codes": ["US"]}
            ]
        });
        let parser = LenientParser {
            fallback: Country::ALL,
        };
        let results = parser.parse(&payload, &batch).unwrap();
        assert_eq!(results.len(), 2);
        // Case-insensitive match recovers the submitted spelling.
        assert_eq!(results[0].keyword, "kostenlos");
        assert_eq!(results[0].countries, vec![Country::DE]);
        // Skipped keyword gets the fallback assignment.
        assert_eq!(results[1].countries, vec![Country::ALL]);
        assert_eq!(results[1].rationale.as_deref(), Some(FALLBACK_RATIONALE));
    }

    #[test]
    fn payload_extraction_handles_both_envelopes() {
        let responses_shape = json!({
            "output": [
                {"content": [{"type": "output_text", "text": "{\"a\": 1}"}]}
            ]
        });
        assert_eq!(extract_json_payload(&responses_shape).unwrap(), json!({"a": 1}));

        let chat_shape = json!({
            "choices": [
                {"message": {"content": "```json\n{\"b\": 2}\n```"}}
            ]
        });
        assert_eq!(extract_json_payload(&chat_shape).unwrap(), json!({"b": 2}));
    }

    // ---- Retry combinator ----

    #[test]
    fn retry_recovers_after_transient_failure() {
        let attempts = AtomicUsize::new(0);
        let result: Result<u32, PipelineError> =
            block_on(retry_with_backoff("test", 3, |_| {
                let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 2 {
                        CallOutcome::Retryable("boom".to_string())
                    } else {
                        CallOutcome::Success(7)
                    }
                }
            }));
        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn retry_stops_immediately_on_fatal() {
        let attempts = AtomicUsize::new(0);
        let result: Result<u32, PipelineError> =
            block_on(retry_with_backoff("test", 5, |_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { CallOutcome::Fatal(PipelineError::PermanentApi("401".to_string())) }
            }));
        assert!(matches!(result, Err(PipelineError::PermanentApi(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn retry_reports_exhaustion_as_transient() {
        let result: Result<u32, PipelineError> =
            block_on(retry_with_backoff("test", 1, |_| async {
                CallOutcome::Retryable("still down".to_string())
            }));
        assert!(matches!(result, Err(PipelineError::TransientApi(_))));
    }

    // ---- Fallback policy ----

    #[test]
    fn fallback_covers_whole_batch_with_rationale() {
        let batch = vec![record("alpha", None), record("beta", None)];
        let results = fallback_batch(&batch, Country::ALL);
        assert_eq!(results.len(), 2);
        for result in &results {
            assert_eq!(result.countries, vec![Country::ALL]);
            assert_eq!(result.rationale.as_deref(), Some(FALLBACK_RATIONALE));
        }
    }

    // ---- Merging ----

    #[test]
    fn merge_is_idempotent() {
        let result = ClassificationResult {
            keyword: "kostenlos".to_string(),
            countries: vec![Country::DE, Country::ALL],
            rationale: None,
        };
        let mut once = CountryKeywordIndex::new();
        once.absorb_results(std::slice::from_ref(&result));
        let mut twice = CountryKeywordIndex::new();
        twice.absorb_results(&[result.clone(), result]);
        assert_eq!(once.freeze(), twice.freeze());
    }

    #[test]
    fn freeze_sorts_case_insensitively_and_dedupes() {
        let mut index = CountryKeywordIndex::new();
        index.insert(Country::US, "Zebra");
        index.insert(Country::US, "apple");
        index.insert(Country::US, "Banana");
        index.insert(Country::US, "apple");
        let frozen = index.freeze();
        assert_eq!(
            frozen.buckets[&Country::US],
            vec!["apple", "Banana", "Zebra"]
        );
    }

    #[test]
    fn json_output_is_deterministic() {
        let build = |order: &[(&str, Country)]| {
            let mut index = CountryKeywordIndex::new();
            for (kw, country) in order {
                index.insert(*country, kw);
            }
            index.freeze().to_json_string().unwrap()
        };
        let a = build(&[("x", Country::US), ("y", Country::DE), ("z", Country::US)]);
        let b = build(&[("z", Country::US), ("x", Country::US), ("y", Country::DE)]);
        assert_eq!(a, b);
    }

    // ---- Pipeline ----

    #[test]
    fn preassigned_records_need_no_classifier_calls() {
        let loaded =
            load_records("keyword,country_code\nfree shipping,US\ndetox tea,UK\n").unwrap();
        let mock = MockClassifier::new(&[]);
        let results = classify_pending(&mock, &loaded.pending, &test_config()).unwrap();
        assert!(results.is_empty());
        assert_eq!(mock.calls.load(Ordering::SeqCst), 0);

        let mut index = CountryKeywordIndex::new();
        index.absorb_preassigned(&loaded.preassigned);
        let frozen = index.freeze();
        assert_eq!(frozen.buckets[&Country::US], vec!["free shipping"]);
        assert_eq!(frozen.buckets[&Country::UK], vec!["detox tea"]);
    }

    #[test]
    fn end_to_end_example_with_mock_classifier() {
        let csv_text = "keyword,country_code\nFreeShipping,US\nkostenlos,\n";
        let loaded = load_records(csv_text).unwrap();
        let mock = MockClassifier::new(&[("kostenlos", &[Country::DE])]);
        let results = classify_pending(&mock, &loaded.pending, &test_config()).unwrap();

        let mut index = CountryKeywordIndex::new();
        index.absorb_preassigned(&loaded.preassigned);
        index.absorb_results(&results);
        let frozen = index.freeze();

        let value: Value = serde_json::from_str(&frozen.to_json_string().unwrap()).unwrap();
        assert_eq!(value, json!({"DE": ["kostenlos"], "US": ["FreeShipping"]}));
    }

    #[test]
    fn every_keyword_survives_even_when_classifier_defaults() {
        let pending: Vec<KeywordRecord> =
            (0..23).map(|i| record(&format!("kw{i}"), None)).collect();
        // Nothing in the table, so every keyword falls back to ALL.
        let mock = MockClassifier::new(&[]);
        let results = classify_pending(&mock, &pending, &test_config()).unwrap();
        assert_eq!(results.len(), pending.len());

        let mut index = CountryKeywordIndex::new();
        index.absorb_results(&results);
        let frozen = index.freeze();
        assert_eq!(frozen.buckets[&Country::ALL].len(), pending.len());
    }

    #[test]
    fn permanent_error_aborts_the_run() {
        let pending: Vec<KeywordRecord> =
            (0..5).map(|i| record(&format!("kw{i}"), None)).collect();
        let mut cfg = test_config();
        cfg.batch_size = 2;
        let err = classify_pending(&BrokenAuthClassifier, &pending, &cfg).unwrap_err();
        let err = err.downcast::<PipelineError>().unwrap();
        assert!(matches!(err, PipelineError::PermanentApi(_)));
    }

    // ---- Output writing ----

    #[test]
    fn writer_produces_both_files_atomically() {
        let dir = tempdir().unwrap();
        let loaded = load_records(
            "keyword,Reason_to_Flag,country_code\nfree shipping,Promo claim,US\nkostenlos,Promo claim,\n",
        )
        .unwrap();
        let results = vec![ClassificationResult {
            keyword: "kostenlos".to_string(),
            countries: vec![Country::DE],
            rationale: Some("German term".to_string()),
        }];
        let mut index = CountryKeywordIndex::new();
        index.absorb_preassigned(&loaded.preassigned);
        index.absorb_results(&results);
        let frozen = index.freeze();

        write_outputs(&frozen, &loaded, &results, dir.path()).unwrap();

        let json_path = dir.path().join("violation_patterns.json");
        let csv_path = dir.path().join("violation_patterns.csv");
        assert!(json_path.exists());
        assert!(csv_path.exists());
        assert!(!dir.path().join("violation_patterns.json.tmp").exists());
        assert!(!dir.path().join("violation_patterns.csv.tmp").exists());

        let value: Value =
            serde_json::from_str(&fs::read_to_string(&json_path).unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"DE": ["kostenlos"], "US": ["free shipping"]})
        );

        let csv_text = fs::read_to_string(&csv_path).unwrap();
        let lines: Vec<&str> = csv_text.lines().collect();
        assert_eq!(lines.len(), 3); // header + one row per assignment
        assert_eq!(
            lines[0],
            "Keyword,Country_Code,Reason_to_Flag,Compliance_Region,Analysis"
        );
        assert!(lines.iter().any(|l| l.contains("German term")));
    }

    #[test]
    fn writer_rejects_unwritable_directory() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        let loaded = load_records("keyword,country_code\nfoo,US\n").unwrap();
        let mut index = CountryKeywordIndex::new();
        index.absorb_preassigned(&loaded.preassigned);
        let err = write_outputs(&index.freeze(), &loaded, &[], &missing).unwrap_err();
        assert!(matches!(err, PipelineError::Write(_)));
    }
}
