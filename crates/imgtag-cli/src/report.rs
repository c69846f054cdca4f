//! Terminal rendering for predictions, training runs, and mirror tables.

use std::fmt::Write as _;
use std::path::Path;

use anyhow::bail;
use arrow::util::pretty::pretty_format_batches;
use imgtag_ai::TrainingRun;
use imgtag_core::Prediction;
use imgtag_store::MirrorExport;

const MAX_SCORES: usize = 10;

pub fn print_prediction(prediction: &Prediction) {
    print!("{}", prediction_card(prediction));
}

/// Vertical card: the winning label, then every score, highest first.
fn prediction_card(prediction: &Prediction) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "=== {} ===", prediction.sample_path);
    let _ = writeln!(
        out,
        "  {:<26} {} ({:.4})",
        "predicted", prediction.predicted_label, prediction.confidence
    );

    let mut ranked: Vec<&(String, f32)> = prediction.scores.iter().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    let _ = writeln!(out, "  scores ({}):", ranked.len());
    for (label, score) in ranked.iter().take(MAX_SCORES) {
        let _ = writeln!(out, "    {label:<28} {score:.4}");
    }
    if ranked.len() > MAX_SCORES {
        let _ = writeln!(out, "    ... and {} more", ranked.len() - MAX_SCORES);
    }
    out
}

pub fn print_training(run: &TrainingRun, model_path: &Path) {
    let s = &run.summary;
    println!("=== Training ===");
    println!("  {:<26} {}", "examples", s.examples);
    println!("  {:<26} {}", "classes", s.classes);
    println!("  {:<26} {}", "labels", run.model.vocabulary.labels().join(", "));
    println!("  {:<26} {:.6}", "final loss", s.final_loss);
    println!("  {:<26} {:.2}s", "elapsed", s.elapsed.as_secs_f64());
    println!("  {:<26} {}", "model", model_path.display());
    if !s.skipped.is_empty() {
        println!("  skipped ({}):", s.skipped.len());
        for path in s.skipped.iter().take(MAX_SCORES) {
            println!("    {path}");
        }
        if s.skipped.len() > MAX_SCORES {
            println!("    ... and {} more", s.skipped.len() - MAX_SCORES);
        }
    }
    if let Some(report) = &run.evaluation {
        println!();
        println!("=== Evaluation ===");
        println!("{report}");
    }
}

/// Print every mirror table, or only `only`.
pub fn print_mirror(export: &MirrorExport, only: Option<&str>) -> anyhow::Result<()> {
    let tables = export.tables();
    if let Some(name) = only
        && !tables.iter().any(|(t, _)| *t == name)
    {
        let known: Vec<&str> = tables.iter().map(|(t, _)| *t).collect();
        bail!("unknown table {name}; expected one of {}", known.join(", "));
    }
    for (name, batch) in tables {
        if only.is_some_and(|o| o != name) {
            continue;
        }
        println!("{name} ({} rows)", batch.num_rows());
        println!("{}", pretty_format_batches(&[batch.clone()])?);
        println!();
    }
    Ok(())
}
