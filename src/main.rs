// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use anyhow::{Context, Result};
use clap::Parser;
use indexmap::IndexMap;
use log::{debug, error, info, warn};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(
    version = "0.2.0",
    about = "Detect renamed fields in the Huya search API snapshot and patch the Dart client to match",
    long_about = "Reads a previously fetched snapshot of the Huya search API, checks that the field \
names the Dart client depends on still exist in a sample document, guesses replacements for missing \
fields by keyword matching, and rewrites the quoted field-name literals in the client source in place. \
Intended to run as one step of a non-concurrent CI pipeline, after the upstream fetch job."
)]
struct Args {
    /// Path to the API snapshot JSON produced by the upstream fetch step
    #[arg(long, default_value = "scripts/huya_api.json", help = "API snapshot JSON file (missing file means nothing to check)")]
    snapshot: PathBuf,

    /// Dart source file whose quoted field-name literals are rewritten in place
    #[arg(long, default_value = "simple_live_core/lib/src/huya_site.dart", help = "Target source file patched in place when drift is detected")]
    target: PathBuf,

    /// Response nodes searched for a sample document, highest priority first
    #[arg(long, default_value = "1,3", value_delimiter = ',', help = "Comma-separated response node ids, tried in order")]
    nodes: Vec<String>,

    /// JSON file overriding the built-in watch-list: {"field": ["hint", ...], ...}
    #[arg(long, help = "Watch-list override file; key order in the file is the check order")]
    watch_list: Option<PathBuf>,
}

/// Canonical field name -> ordered keyword hints, checked in insertion order.
type WatchList = IndexMap<String, Vec<String>>;

/// Canonical field name -> replacement discovered in the sample document.
type ReplacementMapping = IndexMap<String, String>;

/// How a single run ended. Every variant is a clean exit; hard failures
/// surface as errors instead.
#[derive(Debug, PartialEq)]
enum Outcome {
    /// The snapshot file does not exist yet; nothing to check.
    SnapshotMissing,
    /// No documents under any of the configured response nodes.
    SampleMissing,
    /// Every watched field is still present in the sample.
    Clean,
    /// Drift was found and the target was rewritten; occurrence count per field.
    Patched(IndexMap<String, usize>),
}

/// The fields the Dart client reads from search documents, with the keywords
/// used to recognize each one if the API renames it. Mirrors the literals in
/// the target source, so the names here must match the quoting there exactly.
fn default_watch_list() -> WatchList {
    let mut list = WatchList::new();
    list.insert(
        "game_subChannel".to_string(),
        vec!["channel".to_string(), "room_id".to_string(), "id".to_string()],
    );
    list.insert(
        "game_nick".to_string(),
        vec!["nick".to_string(), "name".to_string(), "anchor".to_string()],
    );
    list.insert(
        "game_screenshot".to_string(),
        vec!["screenshot".to_string(), "cover".to_string(), "pic".to_string()],
    );
    list.insert(
        "game_introduction".to_string(),
        vec!["introduction".to_string(), "intro".to_string(), "desc".to_string()],
    );
    list.insert(
        "game_total_count".to_string(),
        vec!["total".to_string(), "count".to_string(), "online".to_string()],
    );
    list
}

fn load_watch_list(path: &Path) -> Result<WatchList> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Could not read watch-list file {}", path.display()))?;
    let mut list: WatchList = serde_json::from_str(&raw)
        .with_context(|| format!("Watch-list file {} is not a JSON object of hint arrays", path.display()))?;

    // Hints are matched against lowercased keys, so normalize them up front.
    for hints in list.values_mut() {
        for hint in hints.iter_mut() {
            *hint = hint.to_lowercase();
        }
    }
    Ok(list)
}

/// Picks the replacement for a vanished field: hints are tried in order, and
/// for each hint the sample's keys are scanned in document order. The first
/// key whose lowercased text contains the hint as a substring wins.
fn find_replacement<'a>(hints: &[String], sample: &'a Map<String, Value>) -> Option<&'a str> {
    for hint in hints {
        for key in sample.keys() {
            if key.to_lowercase().contains(hint.as_str()) {
                return Some(key);
            }
        }
    }
    None
}

struct DriftReconciler {
    snapshot_path: PathBuf,
    target_path: PathBuf,
    nodes: Vec<String>,
    watch_list: WatchList,
}

impl DriftReconciler {
    /// Loads the snapshot JSON. A missing file is the expected "upstream fetch
    /// was skipped" case and yields `None`; malformed JSON is an error.
    fn load_snapshot(&self) -> Result<Option<Value>> {
        if !self.snapshot_path.exists() {
            info!("Snapshot {} not found, nothing to check", self.snapshot_path.display());
            return Ok(None);
        }

        let raw = fs::read_to_string(&self.snapshot_path)
            .with_context(|| format!("Could not read snapshot {}", self.snapshot_path.display()))?;
        let data: Value = serde_json::from_str(&raw)
            .with_context(|| format!("Snapshot {} is not valid JSON", self.snapshot_path.display()))?;

        info!("Loaded snapshot from {}", self.snapshot_path.display());
        Ok(Some(data))
    }

    /// Returns the first document of the first configured response node that
    /// has a non-empty `docs` array. Node "1" before "3" by default: the
    /// currently-live results carry the most reliable field names.
    fn select_sample<'a>(&self, snapshot: &'a Value) -> Option<&'a Map<String, Value>> {
        let response = snapshot.get("response")?.as_object()?;

        for node in &self.nodes {
            let docs = response
                .get(node)
                .and_then(|n| n.get("docs"))
                .and_then(Value::as_array);
            if let Some(docs) = docs {
                if let Some(sample) = docs.first().and_then(Value::as_object) {
                    debug!("Using sample document from response node {} ({} docs)", node, docs.len());
                    return Some(sample);
                }
            }
        }
        None
    }

    /// Diffs the watch-list against the sample's keys and guesses replacements
    /// for the fields that went missing. Fields with no matching candidate are
    /// logged and skipped; they never fail the run.
    fn diagnose(&self, sample: &Map<String, Value>) -> ReplacementMapping {
        let mut updates = ReplacementMapping::new();

        for (canonical, hints) in &self.watch_list {
            if sample.contains_key(canonical) {
                debug!("Field \"{}\" is still present", canonical);
                continue;
            }

            match find_replacement(hints, sample) {
                Some(replacement) => {
                    info!(
                        "Field \"{}\" is gone, best candidate in the new shape is \"{}\"",
                        canonical, replacement
                    );
                    updates.insert(canonical.clone(), replacement.to_string());
                }
                None => {
                    info!(
                        "Field \"{}\" is gone and no key matches hints {:?}; leaving it unresolved",
                        canonical, hints
                    );
                }
            }
        }
        updates
    }

    /// Rewrites every quoted occurrence of each remapped field name in the
    /// target file. The target is opaque text, so this relies on the canonical
    /// names appearing only as the exact quoted literals `"name"`.
    fn patch(&self, updates: &ReplacementMapping) -> Result<IndexMap<String, usize>> {
        if !self.target_path.exists() {
            anyhow::bail!(
                "Target file {} does not exist but {} field(s) need patching",
                self.target_path.display(),
                updates.len()
            );
        }

        let mut code = fs::read_to_string(&self.target_path)
            .with_context(|| format!("Could not read target {}", self.target_path.display()))?;

        let mut counts = IndexMap::new();
        for (old, new) in updates {
            let needle = format!("\"{}\"", old);
            let occurrences = code.matches(needle.as_str()).count();
            if occurrences == 0 {
                warn!("No quoted occurrence of \"{}\" in {}", old, self.target_path.display());
            }
            code = code.replace(&needle, &format!("\"{}\"", new));
            counts.insert(old.clone(), occurrences);
        }

        // Nothing was actually replaced (e.g. a prior run already patched the
        // file); rewriting identical bytes would only churn the mtime.
        if counts.values().sum::<usize>() == 0 {
            info!("No occurrences left to replace in {}, leaving it untouched", self.target_path.display());
            return Ok(counts);
        }

        fs::write(&self.target_path, &code)
            .with_context(|| format!("Could not write target {}", self.target_path.display()))?;
        Ok(counts)
    }

    fn run(&self) -> Result<Outcome> {
        let snapshot = match self.load_snapshot()? {
            Some(data) => data,
            None => return Ok(Outcome::SnapshotMissing),
        };

        let sample = match self.select_sample(&snapshot) {
            Some(sample) => sample,
            None => {
                warn!("No documents under response nodes {:?}; cannot check for drift", self.nodes);
                return Ok(Outcome::SampleMissing);
            }
        };

        let updates = self.diagnose(sample);
        if updates.is_empty() {
            info!("All watched fields are present, the API shape has not drifted");
            return Ok(Outcome::Clean);
        }

        info!("Detected field drift: {:?}", updates);
        let counts = self.patch(&updates)?;
        let total: usize = counts.values().sum();
        if total > 0 {
            info!(
                "Patched {} occurrence(s) across {} field(s) in {}",
                total,
                counts.len(),
                self.target_path.display()
            );
        }
        Ok(Outcome::Patched(counts))
    }
}

fn try_main() -> Result<()> {
    let args = Args::parse();

    let watch_list = match &args.watch_list {
        Some(path) => load_watch_list(path)?,
        None => default_watch_list(),
    };
    if watch_list.is_empty() {
        anyhow::bail!("Watch-list is empty, there is nothing to check");
    }

    let reconciler = DriftReconciler {
        snapshot_path: args.snapshot,
        target_path: args.target,
        nodes: args.nodes,
        watch_list,
    };
    reconciler.run()?;
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stdout)
        .init();

    // Diagnostics live on stdout, so fatal errors go through the logger too
    // instead of anyhow's stderr debug print.
    match try_main() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("Could not complete the check: {:#}", err);
            ExitCode::FAILURE
        }
    }
}
