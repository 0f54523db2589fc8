//! Replay a scenario against a live aggregation cache.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use clap::ValueEnum;
use meter_cache::{AggregationCache, StatsSnapshot};
use meter_core::{AggregationResult, MemorySource, MeterError, SharedMetadata, UpdateBus};
use miette::Result;
use tracing::{debug, info};

use crate::scenario::{Scenario, SourceKind, Step};

/// How long a settle may wait for the update listener to drain the bus.
const LISTENER_CATCH_UP: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable tables
    Text,
    /// One JSON object per line
    Json,
}

#[derive(Debug, Clone)]
pub struct ReplayOptions {
    /// Fetch timeout applied when the scenario does not set one.
    pub fetch_timeout: Option<Duration>,
    pub bus_capacity: usize,
}

/// Everything observed during a replay.
#[derive(Debug)]
pub struct ReplayReport {
    /// Results in publish order, as seen by a subscriber attached before the
    /// first step.
    pub results: Vec<Arc<AggregationResult>>,
    pub stats: StatsSnapshot,
}

/// Run `scenario` to completion and collect what the cache published.
pub async fn replay(scenario: Scenario, options: &ReplayOptions) -> Result<ReplayReport> {
    let melee = Arc::new(MemorySource::new("melee"));
    let spell = Arc::new(MemorySource::new("spell"));
    let metadata = Arc::new(match scenario.window {
        Some(window) => SharedMetadata::with_window(window),
        None => SharedMetadata::empty(),
    });

    let mut config = scenario.cache;
    if config.fetch_timeout_ms.is_none() {
        config.fetch_timeout_ms = options
            .fetch_timeout
            .map(|timeout| u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
    }

    let cache = AggregationCache::builder(melee.clone(), spell.clone(), metadata.clone())
        .config(config)
        .spawn();
    let bus = UpdateBus::with_capacity(options.bus_capacity);
    let listener = cache.start_update_listener(&bus);

    let mut stream = cache.subscribe();
    let collector = tokio::spawn(async move {
        let mut results = Vec::new();
        while let Some(result) = stream.next().await {
            results.push(result);
        }
        results
    });

    let source = |kind: SourceKind| match kind {
        SourceKind::Melee => &melee,
        SourceKind::Spell => &spell,
    };

    let step_count = scenario.steps.len();
    for (index, step) in scenario.steps.into_iter().enumerate() {
        debug!(step = index, ?step, "applying scenario step");
        match step {
            Step::SetData {
                source: kind,
                mode,
                actors,
            } => source(kind).set(mode, actors),
            Step::SetWindow { window } => metadata.set_window(window),
            Step::Request { mode } => {
                cache.get_data(mode);
            }
            Step::Update(batch) => bus.publish(batch),
            Step::FailNext { source: kind } => source(kind).fail_next(),
            Step::Settle => settle(&cache, &bus).await?,
        }
    }
    settle(&cache, &bus).await?;

    let stats = cache.stats();
    cache.shutdown();
    listener.abort();
    let results = collector
        .await
        .map_err(|e| miette::miette!("result collector failed: {}", e))?;

    info!(
        steps = step_count,
        published = stats.recomputes_published,
        failed = stats.recomputes_failed,
        "replay finished"
    );
    Ok(ReplayReport { results, stats })
}

/// Wait until the listener has forwarded every bus batch and the cache is idle.
async fn settle(cache: &AggregationCache, bus: &UpdateBus) -> Result<()> {
    tokio::time::timeout(LISTENER_CATCH_UP, async {
        loop {
            let stats = cache.stats();
            if stats.batches_received + stats.batches_missed >= bus.published_count() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .map_err(|_| miette::miette!("update listener did not catch up with the bus"))?;

    cache.settle().await.map_err(|e| miette::miette!("{}", e))
}

/// Print a report in the requested format.
pub fn write_report(
    report: &ReplayReport,
    format: OutputFormat,
    out: &mut impl Write,
) -> Result<(), MeterError> {
    match format {
        OutputFormat::Json => {
            for result in &report.results {
                serde_json::to_writer(&mut *out, result.as_ref())?;
                writeln!(out)?;
            }
            serde_json::to_writer(&mut *out, &serde_json::json!({ "stats": report.stats }))?;
            writeln!(out)?;
        }
        OutputFormat::Text => {
            for result in &report.results {
                write_table(result, out)?;
            }
            let stats = &report.stats;
            writeln!(
                out,
                "published {} of {} recomputes ({} failed, {} skipped, {} follow-ups)",
                stats.recomputes_published,
                stats.recomputes_started,
                stats.recomputes_failed,
                stats.recomputes_skipped,
                stats.follow_ups_started,
            )?;
            writeln!(
                out,
                "batches: {} received, {} ignored, {} missed",
                stats.batches_received, stats.batches_ignored, stats.batches_missed,
            )?;
        }
    }
    Ok(())
}

fn write_table(result: &AggregationResult, out: &mut impl Write) -> Result<(), MeterError> {
    let bound = |ts: Option<u64>| ts.map_or_else(|| "-".to_string(), |ts| ts.to_string());
    write!(
        out,
        "#{} {} window {}..{}",
        result.generation,
        result.mode,
        bound(result.window.start_ts),
        bound(result.window.end_ts),
    )?;
    match result.window.reference_time() {
        Some(time) => writeln!(
            out,
            " ({})",
            time.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
        )?,
        None => writeln!(out)?,
    }

    if result.is_empty() {
        writeln!(out, "  (no damage)")?;
    }
    for row in &result.rows {
        writeln!(out, "  actor {:<8} total {}", row.actor.0, row.total())?;
        for (ability, amount) in &row.abilities {
            writeln!(out, "    ability {:<8} {}", ability.0, amount)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use meter_core::{AbilityId, ActorId, Mode};
    use pretty_assertions::assert_eq;

    fn options() -> ReplayOptions {
        ReplayOptions {
            fetch_timeout: Some(Duration::from_secs(5)),
            bus_capacity: 64,
        }
    }

    const RAID: &str = r#"{
        "window": { "start_ts": 1000, "end_ts": 60000 },
        "steps": [
            { "set_data": { "source": "melee", "mode": "normal", "actors": {
                "5": { "unit": { "unit_id": 5, "is_player": true }, "abilities": { "100": 40 } }
            } } },
            { "set_data": { "source": "spell", "mode": "normal", "actors": {
                "5": { "unit": { "unit_id": 5, "is_player": true }, "abilities": { "100": 25 } },
                "6": { "unit": { "unit_id": 6 }, "abilities": { "200": 10 } }
            } } },
            { "request": { "mode": "normal" } },
            "settle",
            { "update": { "kinds": ["new_data"], "event_types": [7] } },
            { "fail_next": { "source": "melee" } },
            { "update": { "kinds": ["filter_changed"] } },
            "settle",
            { "request": { "mode": "heroic" } }
        ]
    }"#;

    #[tokio::test]
    async fn test_replay_collects_every_publish() {
        let scenario = Scenario::from_json(RAID).unwrap();
        let report = replay(scenario, &options()).await.unwrap();

        let generations: Vec<u64> = report.results.iter().map(|r| r.generation).collect();
        assert_eq!(generations, vec![1, 2]);

        let first = &report.results[0];
        assert_eq!(first.mode, Mode::Normal);
        assert_eq!(first.amount(ActorId(5), AbilityId(100)), Some(25));
        assert_eq!(first.amount(ActorId(6), AbilityId(200)), Some(10));

        assert_eq!(report.results[1].mode, Mode::Heroic);
        assert!(report.results[1].is_empty());

        assert_eq!(report.stats.recomputes_failed, 1);
        assert_eq!(report.stats.batches_ignored, 1);
        assert_eq!(report.stats.mode_switches, 1);
    }

    #[tokio::test]
    async fn test_replay_without_window_publishes_nothing() {
        let scenario = Scenario::from_json(
            r#"{ "steps": [ { "request": { "mode": "normal" } }, "settle" ] }"#,
        )
        .unwrap();
        let report = replay(scenario, &options()).await.unwrap();

        assert!(report.results.is_empty());
        assert_eq!(report.stats.recomputes_skipped, 1);
    }

    #[tokio::test]
    async fn test_text_report() {
        let scenario = Scenario::from_json(RAID).unwrap();
        let report = replay(scenario, &options()).await.unwrap();

        let mut out = Vec::new();
        write_report(&report, OutputFormat::Text, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.starts_with("#1 normal window 1000..60000 (1970-01-01T00:00:01Z)\n"));
        assert!(text.contains("  actor 5        total 25\n"));
        assert!(text.contains("    ability 200      10\n"));
        assert!(text.contains("#2 heroic"));
        assert!(text.contains("  (no damage)\n"));
        assert!(text.contains("published 2 of 3 recomputes (1 failed, 0 skipped, 0 follow-ups)"));
    }

    #[tokio::test]
    async fn test_json_report_lines_parse() {
        let scenario = Scenario::from_json(RAID).unwrap();
        let report = replay(scenario, &options()).await.unwrap();

        let mut out = Vec::new();
        write_report(&report, OutputFormat::Json, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);

        let first: AggregationResult = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.generation, 1);
        let stats: serde_json::Value = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(stats["stats"]["recomputes_published"], 2);
    }
}
