//! Scenario files driving a replay.
//!
//! A scenario is a JSON document describing the initial metadata window,
//! optional cache settings and an ordered list of steps.

use std::path::Path;

use meter_cache::CacheConfig;
use meter_core::{MeterError, Mode, PartialAggregate, TimeWindow, UpdateBatch};
use serde::Deserialize;

/// Which partial source a step targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Melee,
    Spell,
}

/// One scenario step.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// Replace what a source serves for a mode.
    SetData {
        source: SourceKind,
        mode: Mode,
        #[serde(default)]
        actors: PartialAggregate,
    },
    /// Load (or with `null`, unload) the metadata window.
    SetWindow {
        #[serde(default)]
        window: Option<TimeWindow>,
    },
    /// Call `get_data` for a mode.
    Request { mode: Mode },
    /// Publish a batch on the update bus.
    Update(UpdateBatch),
    /// Make the next fetch of a source fail.
    FailNext { source: SourceKind },
    /// Wait until the cache is idle.
    Settle,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    /// Window loaded before the first step; absent means metadata not ready.
    #[serde(default)]
    pub window: Option<TimeWindow>,

    /// Cache settings (`watched_event_types`, `fetch_timeout_ms`, `result_buffer`).
    #[serde(flatten)]
    pub cache: CacheConfig,

    pub steps: Vec<Step>,
}

impl Scenario {
    /// Read and parse a scenario file.
    pub async fn load(path: &Path) -> Result<Self, MeterError> {
        let text = tokio::fs::read_to_string(path).await?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, MeterError> {
        let scenario: Self = serde_json::from_str(text)?;
        if scenario.steps.is_empty() {
            return Err(MeterError::Config("scenario has no steps".to_string()));
        }
        Ok(scenario)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meter_core::{AbilityId, ActorId, UpdateKind};
    use std::collections::BTreeSet;
    use std::io::Write;

    const SCENARIO: &str = r#"{
        "window": { "start_ts": 1000, "end_ts": 60000 },
        "watched_event_types": [12, 13, 40],
        "steps": [
            { "set_data": { "source": "melee", "mode": "normal", "actors": {
                "5": { "unit": { "unit_id": 5, "is_player": true }, "abilities": { "100": 40 } }
            } } },
            { "request": { "mode": "heroic" } },
            { "update": { "kinds": ["new_data"], "event_types": [12] } },
            { "fail_next": { "source": "spell" } },
            { "set_window": { "window": null } },
            "settle"
        ]
    }"#;

    #[test]
    fn test_parse_every_step_kind() {
        let scenario = Scenario::from_json(SCENARIO).unwrap();

        assert_eq!(scenario.window, Some(TimeWindow::new(1_000, 60_000)));
        assert_eq!(scenario.cache.watched_event_types, BTreeSet::from([12, 13, 40]));
        assert_eq!(scenario.cache.fetch_timeout_ms, None);
        assert_eq!(scenario.steps.len(), 6);

        match &scenario.steps[0] {
            Step::SetData {
                source,
                mode,
                actors,
            } => {
                assert_eq!(*source, SourceKind::Melee);
                assert_eq!(*mode, Mode::Normal);
                assert_eq!(actors[&ActorId(5)].abilities[&AbilityId(100)], 40);
            }
            other => panic!("unexpected step {other:?}"),
        }
        assert!(matches!(scenario.steps[1], Step::Request { mode: Mode::Heroic }));
        assert!(
            matches!(&scenario.steps[2], Step::Update(batch) if batch.has_kind(UpdateKind::NewData))
        );
        assert!(matches!(
            scenario.steps[3],
            Step::FailNext {
                source: SourceKind::Spell
            }
        ));
        assert!(matches!(scenario.steps[4], Step::SetWindow { window: None }));
        assert!(matches!(scenario.steps[5], Step::Settle));
    }

    #[test]
    fn test_defaults_when_settings_omitted() {
        let scenario = Scenario::from_json(r#"{ "steps": ["settle"] }"#).unwrap();
        assert_eq!(scenario.window, None);
        assert_eq!(scenario.cache.watched_event_types, BTreeSet::from([12, 13]));
    }

    #[test]
    fn test_empty_scenario_rejected() {
        let err = Scenario::from_json(r#"{ "steps": [] }"#).unwrap_err();
        assert!(matches!(err, MeterError::Config(_)));
    }

    #[test]
    fn test_unknown_step_rejected() {
        let err = Scenario::from_json(r#"{ "steps": [{ "explode": {} }] }"#).unwrap_err();
        assert!(matches!(err, MeterError::Json(_)));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SCENARIO.as_bytes()).unwrap();

        let scenario = Scenario::load(file.path()).await.unwrap();
        assert_eq!(scenario.steps.len(), 6);
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Scenario::load(&dir.path().join("missing.json"))
            .await
            .unwrap_err();
        assert!(matches!(err, MeterError::Io(_)));
    }
}
