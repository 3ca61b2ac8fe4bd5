//! # Conflict Resolver
//!
//! Detects divergent copies of an entity and picks a winner.
//!
//! ## Strategies
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  last_write_wins     newest `updated_at`, then newest `timestamp`;     │
//! │                      copies without either lose; ties keep the first   │
//! │                      copy in store order (cache, graph, warehouse, …)  │
//! │                                                                         │
//! │  highest_confidence  largest numeric `confidence`; ties fall back to   │
//! │                      last_write_wins among the tied copies             │
//! │                                                                         │
//! │  manual              no winner; returns                                │
//! │                      { conflict: true, sources: {..},                  │
//! │                        requires_manual_resolution: true }              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::error::CoreError;
use crate::hashing::content_hash;
use crate::types::DataSource;

// =============================================================================
// Strategy
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    #[default]
    LastWriteWins,
    HighestConfidence,
    Manual,
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictStrategy::LastWriteWins => write!(f, "last_write_wins"),
            ConflictStrategy::HighestConfidence => write!(f, "highest_confidence"),
            ConflictStrategy::Manual => write!(f, "manual"),
        }
    }
}

impl FromStr for ConflictStrategy {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "last_write_wins" | "lww" => Ok(ConflictStrategy::LastWriteWins),
            "highest_confidence" | "confidence" => Ok(ConflictStrategy::HighestConfidence),
            "manual" => Ok(ConflictStrategy::Manual),
            other => Err(CoreError::UnknownStrategy(other.to_string())),
        }
    }
}

// =============================================================================
// Copies & Records
// =============================================================================

/// One store's copy of an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictCopy {
    pub source: DataSource,
    pub content_hash: String,
    pub data: Value,
}

impl ConflictCopy {
    pub fn new(source: DataSource, data: Value) -> Self {
        ConflictCopy {
            source,
            content_hash: content_hash(&data),
            data,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    /// Resolved automatically by a strategy.
    Resolved,
    /// Waiting for an operator.
    PendingManual,
    /// Closed by an operator.
    ResolvedManually,
}

/// A detected divergence and how it ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub copies: Vec<ConflictCopy>,
    pub detected_at: DateTime<Utc>,
    pub strategy: ConflictStrategy,
    pub status: ConflictStatus,
    #[serde(default)]
    pub winner: Option<DataSource>,
    #[serde(default)]
    pub resolved_value: Option<Value>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ConflictRecord {
    /// Builds the record for `copies` resolved with `resolution`.
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        copies: Vec<ConflictCopy>,
        strategy: ConflictStrategy,
        resolution: &Resolution,
    ) -> Self {
        let now = Utc::now();
        let (status, winner, resolved_value, resolved_at) = match resolution {
            Resolution::Resolved { winner, value } => (
                ConflictStatus::Resolved,
                Some(*winner),
                Some(value.clone()),
                Some(now),
            ),
            Resolution::Manual { .. } => (ConflictStatus::PendingManual, None, None, None),
        };

        ConflictRecord {
            id: Uuid::new_v4().to_string(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            copies,
            detected_at: now,
            strategy,
            status,
            winner,
            resolved_value,
            resolved_at,
        }
    }

    /// Closes a pending manual conflict with the operator's value.
    pub fn close_manually(&mut self, value: Value) {
        self.status = ConflictStatus::ResolvedManually;
        self.resolved_value = Some(value);
        self.resolved_at = Some(Utc::now());
    }
}

/// Outcome of applying a strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Resolved { winner: DataSource, value: Value },
    /// Needs an operator; `value` is the marker payload.
    Manual { value: Value },
}

impl Resolution {
    pub fn value(&self) -> &Value {
        match self {
            Resolution::Resolved { value, .. } => value,
            Resolution::Manual { value } => value,
        }
    }

    pub fn requires_manual_resolution(&self) -> bool {
        matches!(self, Resolution::Manual { .. })
    }
}

// =============================================================================
// Detection & Resolution
// =============================================================================

/// True when at least two copies hash differently.
pub fn has_conflict(copies: &[ConflictCopy]) -> bool {
    match copies.first() {
        Some(first) => copies.iter().any(|c| c.content_hash != first.content_hash),
        None => false,
    }
}

/// Applies `strategy` to `copies`. Returns `None` when there are no copies.
pub fn resolve(strategy: ConflictStrategy, copies: &[ConflictCopy]) -> Option<Resolution> {
    if copies.is_empty() {
        return None;
    }

    let winner = match strategy {
        ConflictStrategy::LastWriteWins => last_write_wins(copies.iter()),
        ConflictStrategy::HighestConfidence => highest_confidence(copies),
        ConflictStrategy::Manual => return Some(manual(copies)),
    }?;

    Some(Resolution::Resolved {
        winner: winner.source,
        value: winner.data.clone(),
    })
}

fn last_write_wins<'a>(copies: impl Iterator<Item = &'a ConflictCopy>) -> Option<&'a ConflictCopy> {
    let mut best: Option<(&ConflictCopy, WriteTime)> = None;
    for copy in copies {
        let time = write_time(&copy.data);
        match best {
            Some((_, ref best_time)) if time <= *best_time => {}
            _ => best = Some((copy, time)),
        }
    }
    best.map(|(copy, _)| copy)
}

fn highest_confidence(copies: &[ConflictCopy]) -> Option<&ConflictCopy> {
    let confidence = |c: &ConflictCopy| c.data.get("confidence").and_then(Value::as_f64);

    let top = copies
        .iter()
        .filter_map(confidence)
        .fold(None, |acc: Option<f64>, c| Some(acc.map_or(c, |a| a.max(c))));

    match top {
        Some(top) => last_write_wins(copies.iter().filter(|c| confidence(c) == Some(top))),
        None => last_write_wins(copies.iter()),
    }
}

fn manual(copies: &[ConflictCopy]) -> Resolution {
    let sources: Map<String, Value> = copies
        .iter()
        .map(|c| (c.source.to_string(), c.data.clone()))
        .collect();

    Resolution::Manual {
        value: json!({
            "conflict": true,
            "sources": sources,
            "requires_manual_resolution": true,
        }),
    }
}

type WriteTime = (Option<DateTime<Utc>>, Option<DateTime<Utc>>);

fn write_time(data: &Value) -> WriteTime {
    (
        data.get("updated_at").and_then(parse_time),
        data.get("timestamp").and_then(parse_time),
    )
}

/// Accepts RFC 3339 strings or Unix seconds.
fn parse_time(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => {
            let secs = n.as_f64()?;
            let nanos = ((secs.fract()) * 1e9) as u32;
            Utc.timestamp_opt(secs.trunc() as i64, nanos).single()
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_write_wins_picks_newer_value() {
        let copies = vec![
            ConflictCopy::new(
                DataSource::Cache,
                json!({ "value": 10, "updated_at": "2024-01-01T00:00:00Z" }),
            ),
            ConflictCopy::new(
                DataSource::Graph,
                json!({ "value": 20, "updated_at": "2024-01-01T00:00:01Z" }),
            ),
        ];

        assert!(has_conflict(&copies));
        let resolution = resolve(ConflictStrategy::LastWriteWins, &copies).unwrap();
        assert_eq!(
            resolution,
            Resolution::Resolved {
                winner: DataSource::Graph,
                value: copies[1].data.clone()
            }
        );
    }

    #[test]
    fn test_timestamp_used_when_updated_at_missing() {
        let copies = vec![
            ConflictCopy::new(DataSource::Cache, json!({ "value": 1, "timestamp": 200 })),
            ConflictCopy::new(DataSource::Warehouse, json!({ "value": 2, "timestamp": 100 })),
        ];
        let resolution = resolve(ConflictStrategy::LastWriteWins, &copies).unwrap();
        assert_eq!(resolution.value()["value"], 1);
    }

    #[test]
    fn test_ties_keep_first_copy() {
        let copies = vec![
            ConflictCopy::new(DataSource::Cache, json!({ "value": "a" })),
            ConflictCopy::new(DataSource::Graph, json!({ "value": "b" })),
        ];
        let resolution = resolve(ConflictStrategy::LastWriteWins, &copies).unwrap();
        assert_eq!(resolution.value()["value"], "a");
    }

    #[test]
    fn test_highest_confidence_with_lww_fallback() {
        let copies = vec![
            ConflictCopy::new(
                DataSource::Cache,
                json!({ "confidence": 0.9, "updated_at": "2024-01-01T00:00:00Z" }),
            ),
            ConflictCopy::new(
                DataSource::Graph,
                json!({ "confidence": 0.9, "updated_at": "2024-01-02T00:00:00Z" }),
            ),
            ConflictCopy::new(
                DataSource::Warehouse,
                json!({ "confidence": 0.5, "updated_at": "2024-02-01T00:00:00Z" }),
            ),
        ];
        let resolution = resolve(ConflictStrategy::HighestConfidence, &copies).unwrap();
        assert!(matches!(
            resolution,
            Resolution::Resolved {
                winner: DataSource::Graph,
                ..
            }
        ));
    }

    #[test]
    fn test_manual_marker() {
        let copies = vec![
            ConflictCopy::new(DataSource::Cache, json!({ "v": 1 })),
            ConflictCopy::new(DataSource::Graph, json!({ "v": 2 })),
        ];
        let resolution = resolve(ConflictStrategy::Manual, &copies).unwrap();
        assert!(resolution.requires_manual_resolution());
        assert_eq!(resolution.value()["conflict"], true);
        assert_eq!(resolution.value()["sources"]["graph"]["v"], 2);

        let record = ConflictRecord::new("knowledge", "k1", copies, ConflictStrategy::Manual, &resolution);
        assert_eq!(record.status, ConflictStatus::PendingManual);
        assert!(record.resolved_value.is_none());
    }

    #[test]
    fn test_no_conflict_for_identical_copies() {
        let copies = vec![
            ConflictCopy::new(DataSource::Cache, json!({ "v": 1 })),
            ConflictCopy::new(DataSource::Graph, json!({ "v": 1 })),
        ];
        assert!(!has_conflict(&copies));
        assert!(resolve(ConflictStrategy::LastWriteWins, &[]).is_none());
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("lww".parse::<ConflictStrategy>().unwrap(), ConflictStrategy::LastWriteWins);
        assert_eq!(
            ConflictStrategy::HighestConfidence.to_string(),
            "highest_confidence"
        );
        assert!("coin_flip".parse::<ConflictStrategy>().is_err());
    }
}
