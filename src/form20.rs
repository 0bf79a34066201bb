use log::{debug, info, warn};

use booth_reconcile::reconciler::{reconcile_segments, SegmentBooths};
use booth_reconcile::validator::ValidationReport;
use booth_reconcile::*;
use snafu::{prelude::*, Snafu};

use std::collections::HashSet;
use std::fs;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;

use calamine::{open_workbook, Reader, Xlsx};

use serde::{Deserialize, Serialize};
use serde_json::json;
use serde_json::Map as JSMap;
use serde_json::Value as JSValue;
use text_diff::print_diff;

use crate::args::Args;
use crate::form20::config_reader::*;
use crate::form20::io_common::{read_candidates, resolve_path, simplify_file_name};

pub mod config_reader;
pub mod io_common;
pub mod io_csv;
pub mod io_excel;
pub mod io_json;

#[derive(Debug, Snafu)]
pub enum Form20Error {
    #[snafu(display("Error opening file {path}"))]
    OpeningJson {
        source: std::io::Error,
        path: String,
    },
    #[snafu(display("Error parsing the JSON file {path}"))]
    ParsingJson {
        source: serde_json::Error,
        path: String,
    },
    #[snafu(display("Error serializing the output"))]
    SerializingJson { source: serde_json::Error },
    #[snafu(display("Error opening file {path}"))]
    OpeningExcel {
        source: calamine::XlsxError,
        path: String,
    },
    #[snafu(display("No worksheet found in {path}"))]
    EmptyExcel { path: String },
    #[snafu(display("Error opening the CSV file {path}"))]
    CsvOpen { source: csv::Error, path: String },
    #[snafu(display("Error parsing CSV line {lineno}"))]
    CsvLineParse { source: csv::Error, lineno: usize },
    #[snafu(display("Invalid candidates in {path}: {source}"))]
    InvalidCandidates {
        source: CandidateDataError,
        path: String,
    },
    #[snafu(display("Error writing {path}"))]
    WritingOutput {
        source: std::io::Error,
        path: String,
    },
    #[snafu(display("No file name in {path}"))]
    MissingFileName { path: String },
    #[snafu(display("The configuration file has no parent directory"))]
    MissingParentDir {},
    #[snafu(display("Unknown acceptance policy {name}"))]
    UnknownPolicy { name: String },
    #[snafu(display("Unknown input type {provider}"))]
    UnknownProvider { provider: String },
    #[snafu(display("Missing argument --{name}"))]
    MissingArgument { name: String },

    #[snafu(whatever, display("{message}"))]
    Whatever {
        message: String,
        #[snafu(source(from(Box<dyn std::error::Error>, Some)))]
        source: Option<Box<dyn std::error::Error>>,
    },
}

pub type Form20Result<T> = Result<T, Form20Error>;

// ********* Jobs and outcomes ***********

/// Everything needed to process one unit.
#[derive(PartialEq, Debug, Clone)]
pub struct UnitJob {
    pub unit_id: String,
    pub provider: String,
    pub rows_path: String,
    pub candidates_path: String,
    pub expected_booths: usize,
    pub worksheet_name: Option<String>,
    pub reference_path: Option<String>,
    pub rules: ExtractionRules,
}

#[derive(Eq, PartialEq, Debug, Clone)]
pub enum OutputTarget {
    Directory(PathBuf),
    Stdout,
}

#[derive(PartialEq, Debug, Clone)]
pub struct UnitOutcome {
    pub unit_id: String,
    pub record: Option<CanonicalRecord>,
    pub record_js: Option<JSValue>,
    pub diagnostics: JSValue,
    /// None when no reference was given.
    pub reference_matches: Option<bool>,
}

impl UnitOutcome {
    fn failure(unit_id: &str, kind: &str, reason: &str) -> UnitOutcome {
        UnitOutcome {
            unit_id: unit_id.to_string(),
            record: None,
            record_js: None,
            diagnostics: json!({
                "unitId": unit_id,
                "status": "failed",
                "errorKind": kind,
                "reason": reason,
            }),
            reference_matches: None,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.record.is_some()
    }
}

#[derive(PartialEq, Debug, Clone)]
pub struct BatchOutcome {
    pub outcomes: Vec<UnitOutcome>,
    pub apportionments: Vec<JSValue>,
    pub apportionment_failures: usize,
}

impl BatchOutcome {
    pub fn accepted(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_accepted()).count()
    }

    pub fn reference_mismatches(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.reference_matches == Some(false))
            .count()
    }

    pub fn is_success(&self) -> bool {
        self.accepted() == self.outcomes.len()
            && self.reference_mismatches() == 0
            && self.apportionment_failures == 0
    }

    pub fn summary(&self) -> String {
        format!(
            "{} units: {} accepted, {} not accepted, {} reference mismatches, {} failed apportionments",
            self.outcomes.len(),
            self.accepted(),
            self.outcomes.len() - self.accepted(),
            self.reference_mismatches(),
            self.apportionment_failures
        )
    }

    pub fn diagnostics_js(&self) -> JSValue {
        let units: Vec<JSValue> = self.outcomes.iter().map(|o| o.diagnostics.clone()).collect();
        json!({
            "summary": self.summary(),
            "units": units,
            "apportionments": self.apportionments,
        })
    }
}

// ********* Reading ***********

pub fn read_rows(
    provider: &str,
    path: &str,
    worksheet_name: Option<&str>,
) -> Form20Result<Vec<Vec<String>>> {
    info!("read_rows: reading {} file {:?}", provider, path);
    match provider {
        "json" => io_json::read_json_rows(path),
        "csv" => io_csv::read_csv_rows(path),
        "xlsx" | "excel" => io_excel::read_excel_rows(path, worksheet_name),
        x => UnknownProviderSnafu { provider: x }.fail(),
    }
}

fn provider_from_extension(path: &str) -> String {
    match Path::new(path).extension().and_then(|e| e.to_str()) {
        Some("csv") => "csv".to_string(),
        Some("xlsx") => "xlsx".to_string(),
        _ => "json".to_string(),
    }
}

// ********* Output ***********

fn round6(x: f64) -> f64 {
    (x * 1e6).round() / 1e6
}

fn errors_by_name(report: &ValidationReport, candidates: &[Candidate]) -> JSMap<String, JSValue> {
    let mut res: JSMap<String, JSValue> = JSMap::new();
    for (idx, err) in report.errors_by_candidate.iter() {
        let name = candidates
            .get(*idx)
            .map(|c| c.name.clone())
            .unwrap_or_else(|| format!("#{}", idx));
        res.insert(name, json!(round6(*err)));
    }
    res
}

/// The persisted form of an accepted unit.
pub fn record_to_json(record: &CanonicalRecord) -> JSValue {
    let candidates: Vec<JSValue> = record
        .results
        .iter()
        .map(|r| {
            json!({
                "name": r.candidate.name,
                "party": r.candidate.party,
                "position": r.candidate.position,
                "boothVotes": r.booth_votes,
                "postalVotes": r.postal_votes,
                "total": r.total,
            })
        })
        .collect();
    let booths: Vec<JSValue> = record
        .booths
        .iter()
        .map(|b| {
            json!({
                "booth": b.booth_id.to_string(),
                "votes": b.raw_votes,
                "declaredTotal": b.declared_total,
                "rejected": b.rejected,
                "nota": b.nota,
                "sourceRow": b.source_row.index,
            })
        })
        .collect();
    let mapping: Vec<JSValue> = record
        .extraction
        .column_mapping
        .pairs()
        .map(|(col, cand)| json!({"column": col, "candidate": record.candidates[cand].name}))
        .collect();
    let warnings: Vec<String> = record
        .extraction
        .warnings
        .iter()
        .map(|w| format!("row {}: {}", w.source_row.index, w.message))
        .collect();
    json!({
        "unitId": record.unit_id,
        "sourceDigest": record.source_digest,
        "layout": record.layout,
        "policy": record.validation.policy,
        "scale": round6(record.extraction.scale),
        "coverageRatio": round6(record.validation.coverage_ratio),
        "meanError": round6(record.validation.mean_error),
        "columnMapping": mapping,
        "candidates": candidates,
        "booths": booths,
        "warnings": warnings,
    })
}

fn accepted_diagnostics(record: &CanonicalRecord) -> JSValue {
    json!({
        "unitId": record.unit_id,
        "status": "accepted",
        "layout": record.layout,
        "policy": record.validation.policy,
        "boothCount": record.booths.len(),
        "coverageRatio": round6(record.validation.coverage_ratio),
        "meanError": round6(record.validation.mean_error),
        "errorsByCandidate": errors_by_name(&record.validation, &record.candidates),
        "rowCoverage": round6(record.row_coverage),
        "rowRejections": record.row_rejections,
        "extractionErrors": record.extraction.errors,
    })
}

fn attempt_js(e: &ExtractionError, candidates: &[Candidate]) -> JSValue {
    let mut res = json!({"errorKind": e.kind(), "reason": e.to_string()});
    match e {
        ExtractionError::NoBoothRows { layout, rejections } => {
            res["layout"] = json!(layout);
            res["rowRejections"] = json!(rejections);
        }
        ExtractionError::InsufficientColumnMatches {
            layout,
            mapped,
            required,
        } => {
            res["layout"] = json!(layout);
            res["mapped"] = json!(mapped);
            res["required"] = json!(required);
        }
        ExtractionError::AccuracyRejected { layout, report } => {
            res["layout"] = json!(layout);
            res["coverageRatio"] = json!(round6(report.coverage_ratio));
            res["meanError"] = json!(round6(report.mean_error));
            res["errorsByCandidate"] = JSValue::Object(errors_by_name(report, candidates));
        }
        _ => {}
    }
    res
}

fn rejected_diagnostics(unit_id: &str, e: &ExtractionError, candidates: &[Candidate]) -> JSValue {
    let attempts: Vec<JSValue> = match e {
        ExtractionError::AllStrategiesFailed(l) => {
            l.iter().map(|x| attempt_js(x, candidates)).collect()
        }
        x => vec![attempt_js(x, candidates)],
    };
    json!({
        "unitId": unit_id,
        "status": "rejected",
        "errorKind": e.kind(),
        "reason": e.to_string(),
        "attempts": attempts,
    })
}

fn output_file_name(unit_id: &str, suffix: &str) -> String {
    let clean: String = unit_id
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}{}", clean, suffix)
}

/// Writes the file next to its destination first, then moves it in place.
///
/// A reader never sees a partial file, and a failed write leaves the previous file untouched.
pub fn write_atomically(path: &Path, js: &JSValue) -> Form20Result<()> {
    let path_s = path.display().to_string();
    let pretty = serde_json::to_string_pretty(js).context(SerializingJsonSnafu {})?;
    let tmp = path.with_extension("json.tmp");
    let res: std::io::Result<()> = (|| {
        let mut f = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        f.write_all(pretty.as_bytes())?;
        f.sync_all()?;
        drop(f);
        fs::rename(&tmp, path)
    })();
    if res.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    res.context(WritingOutputSnafu { path: path_s.clone() })?;
    debug!("write_atomically: wrote {}", path_s);
    Ok(())
}

/// Compares a record with a reference record. The differences are printed.
pub fn check_reference(reference_path: &str, record_js: &JSValue) -> Form20Result<bool> {
    let reference = read_reference(reference_path)?;
    let pretty_ref = serde_json::to_string_pretty(&reference).context(SerializingJsonSnafu {})?;
    let pretty = serde_json::to_string_pretty(record_js).context(SerializingJsonSnafu {})?;
    if pretty_ref != pretty {
        warn!(
            "check_reference: found differences with the reference {}",
            reference_path
        );
        print_diff(pretty_ref.as_str(), pretty.as_str(), "\n");
        Ok(false)
    } else {
        info!("check_reference: record matches {}", reference_path);
        Ok(true)
    }
}

// ********* Processing ***********

fn process_job(job: &UnitJob, target: &OutputTarget) -> UnitOutcome {
    match process_job_inner(job, target) {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!("process_job: unit {}: {}", job.unit_id, e);
            UnitOutcome::failure(&job.unit_id, "input", &e.to_string())
        }
    }
}

fn process_job_inner(job: &UnitJob, target: &OutputTarget) -> Form20Result<UnitOutcome> {
    let candidates = read_candidates(&job.candidates_path)?;
    let rows = read_rows(&job.provider, &job.rows_path, job.worksheet_name.as_deref())?;

    match process_unit(
        &job.unit_id,
        &rows,
        &candidates,
        job.expected_booths,
        &job.rules,
    ) {
        Ok(record) => {
            let record_js = record_to_json(&record);
            // An unreadable reference fails the unit before anything is written.
            let reference_matches = match &job.reference_path {
                Some(p) => Some(check_reference(p, &record_js)?),
                None => None,
            };
            if let OutputTarget::Directory(dir) = target {
                write_atomically(&dir.join(output_file_name(&job.unit_id, ".json")), &record_js)?;
            }
            Ok(UnitOutcome {
                unit_id: job.unit_id.clone(),
                diagnostics: accepted_diagnostics(&record),
                record: Some(record),
                record_js: Some(record_js),
                reference_matches,
            })
        }
        Err(e) => {
            warn!("process_job: unit {} not accepted: {}", job.unit_id, e);
            Ok(UnitOutcome {
                unit_id: job.unit_id.clone(),
                record: None,
                record_js: None,
                diagnostics: rejected_diagnostics(&job.unit_id, &e, &candidates),
                reference_matches: None,
            })
        }
    }
}

/// Processes the jobs on a pool of worker threads.
///
/// Workers pull the next job from a shared counter. The outcomes come back in the order of
/// the jobs.
pub fn run_jobs(jobs: &[UnitJob], target: &OutputTarget, workers: usize) -> Vec<UnitOutcome> {
    let num_workers = workers.max(1).min(jobs.len().max(1));
    info!(
        "run_jobs: {} units on {} workers",
        jobs.len(),
        num_workers
    );
    let next = AtomicUsize::new(0);
    let (tx, rx) = mpsc::channel::<(usize, UnitOutcome)>();

    std::thread::scope(|scope| {
        for worker_idx in 0..num_workers {
            let tx = tx.clone();
            let next = &next;
            scope.spawn(move || loop {
                let idx = next.fetch_add(1, Ordering::SeqCst);
                let job = match jobs.get(idx) {
                    Some(j) => j,
                    None => break,
                };
                debug!("run_jobs: worker {}: unit {}", worker_idx, job.unit_id);
                let outcome = process_job(job, target);
                if tx.send((idx, outcome)).is_err() {
                    break;
                }
            });
        }
    });
    drop(tx);

    let mut slots: Vec<Option<UnitOutcome>> = jobs.iter().map(|_| None).collect();
    for (idx, outcome) in rx {
        slots[idx] = Some(outcome);
    }
    slots
        .into_iter()
        .zip(jobs.iter())
        .map(|(o, job)| {
            o.unwrap_or_else(|| {
                UnitOutcome::failure(&job.unit_id, "aborted", "the unit was not processed")
            })
        })
        .collect()
}

fn run_apportionment(
    a: &ApportionmentSource,
    root: &Path,
    outcomes: &[UnitOutcome],
) -> Form20Result<JSValue> {
    let parent_path = resolve_path(root, &a.candidates_path).display().to_string();
    let parent = read_candidates(&parent_path)?;

    let mut segments: Vec<SegmentBooths> = Vec::new();
    for s in a.segments.iter() {
        let record = outcomes
            .iter()
            .find(|o| o.unit_id == s.unit_id)
            .and_then(|o| o.record.as_ref());
        let record = match record {
            Some(r) => r,
            None => whatever!(
                "apportionment {}: segment {} has no accepted record",
                a.parent_unit_id,
                s.unit_id
            ),
        };
        // Segments list the candidates in their own order.
        let booth_totals: Vec<u64> = parent
            .iter()
            .map(|c| {
                record
                    .results
                    .iter()
                    .find(|r| r.candidate.name == c.name)
                    .map(|r| r.booth_votes)
                    .unwrap_or(0)
            })
            .collect();
        segments.push(SegmentBooths {
            unit_id: s.unit_id.clone(),
            booth_totals,
            known_totals: s.known_totals.clone(),
        });
    }

    let results = match reconcile_segments(&parent, &segments) {
        Ok(r) => r,
        Err(e) => whatever!("apportionment {}: {}", a.parent_unit_id, e),
    };

    let segments_js: Vec<JSValue> = segments
        .iter()
        .zip(results.iter())
        .map(|(s, res)| {
            let candidates: Vec<JSValue> = res
                .iter()
                .map(|r| {
                    json!({
                        "name": r.candidate.name,
                        "boothVotes": r.booth_votes,
                        "postalVotes": r.postal_votes,
                        "total": r.total,
                    })
                })
                .collect();
            json!({"unitId": s.unit_id, "candidates": candidates})
        })
        .collect();
    Ok(json!({"parentUnitId": a.parent_unit_id, "segments": segments_js}))
}

// ********* Entry points ***********

pub fn run(args: &Args) -> Form20Result<BatchOutcome> {
    match &args.config {
        Some(config_path) => run_batch(config_path, args),
        None => run_single(args),
    }
}

fn output_target(out: Option<&str>) -> Form20Result<OutputTarget> {
    match out {
        None | Some("stdout") => Ok(OutputTarget::Stdout),
        Some(dir) => {
            fs::create_dir_all(dir).context(WritingOutputSnafu { path: dir })?;
            Ok(OutputTarget::Directory(PathBuf::from(dir)))
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

pub fn run_single(args: &Args) -> Form20Result<BatchOutcome> {
    let input = args
        .input
        .as_deref()
        .context(MissingArgumentSnafu { name: "input" })?;
    let candidates_path = args
        .candidates
        .clone()
        .context(MissingArgumentSnafu { name: "candidates" })?;
    let unit_id = match &args.unit_id {
        Some(x) => x.clone(),
        None => simplify_file_name(input)?,
    };
    let job = UnitJob {
        unit_id,
        provider: args
            .input_type
            .clone()
            .unwrap_or_else(|| provider_from_extension(input)),
        rows_path: input.to_string(),
        candidates_path,
        expected_booths: args.expected_booths.unwrap_or(0),
        worksheet_name: args.excel_worksheet_name.clone(),
        reference_path: args.reference.clone(),
        rules: unit_rules(args.policy.as_deref(), None)?,
    };
    let target = output_target(args.out.as_deref())?;
    let outcomes = run_jobs(&[job], &target, 1);
    finish(outcomes, Vec::new(), 0, &target, true)
}

pub fn run_batch(config_path: &str, args: &Args) -> Form20Result<BatchOutcome> {
    let config_p = Path::new(config_path);
    let config = read_batch_config(config_p)?;
    let root = config_p.parent().context(MissingParentDirSnafu {})?;
    info!(
        "run_batch: {} units, {} apportionments",
        config.units.len(),
        config.apportionments.len()
    );

    // Two units must never write the same output file.
    let mut seen: HashSet<String> = HashSet::new();
    let mut jobs: Vec<UnitJob> = Vec::new();
    for u in config.units.iter() {
        let file_name = output_file_name(&u.unit_id, ".json");
        if !seen.insert(file_name.clone()) {
            whatever!(
                "unit {} appears more than once in the batch (output {})",
                u.unit_id,
                file_name
            );
        }
        jobs.push(UnitJob {
            unit_id: u.unit_id.clone(),
            provider: u
                .provider
                .clone()
                .unwrap_or_else(|| provider_from_extension(&u.file_path)),
            rows_path: resolve_path(root, &u.file_path).display().to_string(),
            candidates_path: resolve_path(root, &u.candidates_path)
                .display()
                .to_string(),
            expected_booths: u.expected_booths.unwrap_or(0),
            worksheet_name: u.excel_worksheet_name.clone(),
            reference_path: u
                .reference_path
                .as_ref()
                .map(|p| resolve_path(root, p).display().to_string()),
            rules: unit_rules(u.policy.as_deref(), config.rules.as_ref())?,
        });
    }

    let out = match (&args.out, &config.output_settings.output_directory) {
        (Some(o), _) => Some(o.clone()),
        (None, Some(dir)) => Some(resolve_path(root, dir).display().to_string()),
        (None, None) => None,
    };
    let target = output_target(out.as_deref())?;
    let workers = args
        .workers
        .or(config.workers)
        .unwrap_or_else(default_workers);
    let outcomes = run_jobs(&jobs, &target, workers);

    let mut apportionments: Vec<JSValue> = Vec::new();
    let mut failures = 0usize;
    for a in config.apportionments.iter() {
        match run_apportionment(a, root, &outcomes) {
            Ok(js) => {
                if let OutputTarget::Directory(dir) = &target {
                    write_atomically(
                        &dir.join(output_file_name(&a.parent_unit_id, ".apportionment.json")),
                        &js,
                    )?;
                }
                apportionments.push(js);
            }
            Err(e) => {
                warn!("run_batch: {}", e);
                failures += 1;
                apportionments.push(json!({
                    "parentUnitId": a.parent_unit_id,
                    "status": "failed",
                    "reason": e.to_string(),
                }));
            }
        }
    }

    let write_diagnostics = config.output_settings.write_diagnostics.unwrap_or(true);
    finish(outcomes, apportionments, failures, &target, write_diagnostics)
}

fn finish(
    outcomes: Vec<UnitOutcome>,
    apportionments: Vec<JSValue>,
    apportionment_failures: usize,
    target: &OutputTarget,
    write_diagnostics: bool,
) -> Form20Result<BatchOutcome> {
    let outcome = BatchOutcome {
        outcomes,
        apportionments,
        apportionment_failures,
    };
    match target {
        OutputTarget::Directory(dir) => {
            if write_diagnostics {
                write_atomically(&dir.join("diagnostics.json"), &outcome.diagnostics_js())?;
            }
        }
        OutputTarget::Stdout => {
            let records: Vec<JSValue> = outcome
                .outcomes
                .iter()
                .filter_map(|o| o.record_js.clone())
                .collect();
            let js = json!({
                "records": records,
                "diagnostics": outcome.diagnostics_js(),
            });
            let pretty = serde_json::to_string_pretty(&js).context(SerializingJsonSnafu {})?;
            println!("{}", pretty);
        }
    }
    info!("finish: {}", outcome.summary());
    Ok(outcome)
}
