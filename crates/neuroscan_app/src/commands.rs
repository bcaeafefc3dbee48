//! Subcommand bodies. All decisions live in `neuroscan_core`; this only wires
//! arguments to core operations and prints what comes back.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use neuroscan_core::{
    CoreConfig, FeedbackLedger, JobController, JobInput, JobState, Label, Region, crop_region,
    load_image,
};

pub fn parse_point(raw: &str) -> Result<(f32, f32), String> {
    let (x, y) = raw
        .split_once(',')
        .ok_or_else(|| format!("expected x,y but got {raw:?}"))?;
    let parse = |v: &str| {
        v.trim()
            .parse::<f32>()
            .map_err(|e| format!("bad coordinate {v:?}: {e}"))
    };
    Ok((parse(x)?, parse(y)?))
}

pub fn classify(
    config: &CoreConfig,
    image: PathBuf,
    points: Vec<(f32, f32)>,
    cancel_after_ms: Option<u64>,
    correct: Option<Label>,
) -> Result<()> {
    let input = if points.is_empty() {
        JobInput::Path(image)
    } else {
        let source = load_image(&image)?;
        let cropped = crop_region(&source, &Region::new(points))?;
        tracing::info!(
            width = cropped.width(),
            height = cropped.height(),
            "classifying marked region"
        );
        JobInput::Image(cropped)
    };

    let controller = JobController::new(config.classifier(), config.job_settings());
    let job = controller.start(input)?;
    let cancel_at = cancel_after_ms.map(|ms| Instant::now() + Duration::from_millis(ms));

    let mut stderr = io::stderr();
    let snapshot = loop {
        if cancel_at.is_some_and(|at| Instant::now() >= at) {
            controller.cancel();
        }
        let snapshot = job.snapshot();
        if snapshot.state.is_terminal() {
            break snapshot;
        }
        write!(
            stderr,
            "\rProcessing time: {:.1}s [{:>3.0}%]",
            snapshot.progress.elapsed.as_secs_f32(),
            snapshot.progress.fraction * 100.0
        )?;
        stderr.flush()?;
        thread::sleep(config.tick_interval());
    };
    writeln!(stderr)?;

    match snapshot.state {
        JobState::Completed => {
            let Some(outcome) = snapshot.outcome else {
                bail!("job {} completed without an outcome", snapshot.id);
            };
            println!(
                "Result: {} ({:.1}s)",
                outcome.label(),
                outcome.elapsed().as_secs_f32()
            );
            if let Some(corrected) = correct {
                match outcome.correction(corrected) {
                    Some((original, corrected)) => {
                        let mut ledger = FeedbackLedger::open(&config.ledger_path);
                        ledger.record(original.as_str(), corrected.as_str())?;
                        println!("Thank you for your feedback! Recorded {original} → {corrected}.");
                    }
                    None => println!("Prediction confirmed; nothing recorded."),
                }
            }
            Ok(())
        }
        JobState::Cancelled => {
            println!(
                "Cancelled after {:.1}s",
                snapshot.progress.elapsed.as_secs_f32()
            );
            Ok(())
        }
        JobState::Failed => match snapshot.failure {
            Some(failure) => Err(failure).context("classification failed"),
            None => bail!("job {} failed without a reason", snapshot.id),
        },
        JobState::Idle | JobState::Running => unreachable!("loop exits on terminal states"),
    }
}

pub fn normalize(config: &CoreConfig, image: &Path, output: &Path) -> Result<()> {
    let source = load_image(image)?;
    let normalized = neuroscan_core::normalize(&source, config.job_settings().target_size)?;
    normalized
        .image()
        .save(output)
        .with_context(|| format!("cannot write {}", output.display()))?;
    println!(
        "Wrote {}x{} image to {}",
        normalized.width(),
        normalized.height(),
        output.display()
    );
    Ok(())
}

pub fn crop(image: &Path, output: &Path, points: Vec<(f32, f32)>) -> Result<()> {
    let source = load_image(image)?;
    let cropped = crop_region(&source, &Region::new(points))?;
    cropped
        .save(output)
        .with_context(|| format!("cannot write {}", output.display()))?;
    println!(
        "Wrote {}x{} crop to {}",
        cropped.width(),
        cropped.height(),
        output.display()
    );
    Ok(())
}

pub fn stats(config: &CoreConfig) -> Result<()> {
    let ledger = FeedbackLedger::open(&config.ledger_path);
    println!("{}", serde_json::to_string_pretty(&ledger.statistics())?);
    Ok(())
}
