//! Reconciliation of updates that reach this process over two channels.
//!
//! The same logical record can arrive from the durable subscription feed and
//! from the low-latency transport with no shared ordering. Every candidate
//! strategy that applies to a pair of values proposes a winner with a fixed
//! confidence; the most confident proposal is taken.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, trace};

const TIMESTAMP_FIELDS: [&str; 5] = [
    "updated_at",
    "updatedAt",
    "last_updated",
    "lastUpdated",
    "timestamp",
];
const VERSION_FIELDS: [&str; 3] = ["version", "_version", "revision"];
const STATUS_FIELD: &str = "status";

/// Channel a value arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceChannel {
    /// Durable store subscription feed.
    Subscription,
    /// Low-latency venue transport.
    Transport,
    /// Written by this process.
    Local,
}

impl SourceChannel {
    fn rank(self) -> u8 {
        match self {
            Self::Subscription => 2,
            Self::Transport => 1,
            Self::Local => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    NoConflict,
    TimestampPriority,
    VersionPriority,
    SourcePriority,
    DataIntegrity,
    SmartMerge,
    Fallback,
}

impl ResolutionStrategy {
    pub fn confidence(self) -> f64 {
        match self {
            Self::NoConflict => 1.0,
            Self::TimestampPriority => 0.9,
            Self::VersionPriority => 0.95,
            Self::SourcePriority => 0.7,
            Self::DataIntegrity => 0.85,
            Self::SmartMerge => 0.8,
            Self::Fallback => 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    StatusMismatch,
    VersionMismatch,
    MissingFields,
    ValueMismatch,
}

/// Which input the resolution kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Winner {
    Incoming,
    Existing,
    Merged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictContext {
    pub key: String,
    pub incoming: Value,
    pub existing: Value,
    /// Channel the incoming value arrived on.
    pub source: SourceChannel,
    /// Channel the existing value arrived on, when known.
    pub existing_source: Option<SourceChannel>,
}

impl ConflictContext {
    pub fn new(
        key: impl Into<String>,
        incoming: Value,
        existing: Value,
        source: SourceChannel,
    ) -> Self {
        Self {
            key: key.into(),
            incoming,
            existing,
            source,
            existing_source: None,
        }
    }

    pub fn with_existing_source(mut self, source: SourceChannel) -> Self {
        self.existing_source = Some(source);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub key: String,
    pub value: Value,
    pub winner: Winner,
    pub strategy: ResolutionStrategy,
    pub confidence: f64,
    pub conflict_type: Option<ConflictType>,
    pub source: SourceChannel,
    pub reason: String,
    pub latency_us: u64,
    pub resolved_at: DateTime<Utc>,
}

impl ConflictResolution {
    pub fn keeps_existing(&self) -> bool {
        self.winner == Winner::Existing
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolverMetrics {
    pub total: u64,
    pub conflicts: u64,
    pub by_type: BTreeMap<ConflictType, u64>,
    pub by_strategy: BTreeMap<ResolutionStrategy, u64>,
    pub incoming_wins: u64,
    pub existing_wins: u64,
    pub merges: u64,
    pub mean_latency_us: f64,
}

struct Proposal {
    strategy: ResolutionStrategy,
    winner: Winner,
    value: Value,
    reason: String,
}

struct ResolverState {
    history: VecDeque<ConflictResolution>,
    metrics: ResolverMetrics,
    latency_total_us: u64,
}

pub struct ConflictResolver {
    history_limit: usize,
    required_fields: Vec<String>,
    numeric_fields: Vec<String>,
    state: Mutex<ResolverState>,
}

impl ConflictResolver {
    /// Resolver with the position field set.
    pub fn new(history_limit: usize) -> Self {
        Self {
            history_limit: history_limit.max(1),
            required_fields: ["id", "status", "account_id", "symbol"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            numeric_fields: ["volume", "entry_price", "current_price", "trail_width"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            state: Mutex::new(ResolverState {
                history: VecDeque::new(),
                metrics: ResolverMetrics::default(),
                latency_total_us: 0,
            }),
        }
    }

    pub fn with_required_fields(mut self, fields: &[&str]) -> Self {
        self.required_fields = fields.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_numeric_fields(mut self, fields: &[&str]) -> Self {
        self.numeric_fields = fields.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn resolve(
        &self,
        key: &str,
        incoming: Value,
        existing: Value,
        source: SourceChannel,
    ) -> ConflictResolution {
        self.resolve_context(ConflictContext::new(key, incoming, existing, source))
    }

    pub fn resolve_context(&self, ctx: ConflictContext) -> ConflictResolution {
        let started = Instant::now();

        let (proposal, conflict_type) = if ctx.incoming == ctx.existing {
            (
                Proposal {
                    strategy: ResolutionStrategy::NoConflict,
                    winner: Winner::Incoming,
                    value: ctx.incoming.clone(),
                    reason: "values identical".to_string(),
                },
                None,
            )
        } else {
            let conflict_type = classify(&ctx.incoming, &ctx.existing);
            let proposal = self
                .proposals(&ctx)
                .into_iter()
                .fold(None::<Proposal>, |best, next| match best {
                    Some(b) if b.strategy.confidence() >= next.strategy.confidence() => Some(b),
                    _ => Some(next),
                })
                .unwrap_or_else(|| Proposal {
                    strategy: ResolutionStrategy::Fallback,
                    winner: Winner::Incoming,
                    value: ctx.incoming.clone(),
                    reason: "no strategy applied, keeping incoming".to_string(),
                });
            (proposal, Some(conflict_type))
        };

        let resolution = ConflictResolution {
            key: ctx.key,
            value: proposal.value,
            winner: proposal.winner,
            strategy: proposal.strategy,
            confidence: proposal.strategy.confidence(),
            conflict_type,
            source: ctx.source,
            reason: proposal.reason,
            latency_us: started.elapsed().as_micros() as u64,
            resolved_at: Utc::now(),
        };

        if resolution.conflict_type.is_some() {
            debug!(
                key = %resolution.key,
                strategy = ?resolution.strategy,
                winner = ?resolution.winner,
                confidence = resolution.confidence,
                conflict_type = ?resolution.conflict_type,
                "Conflict resolved"
            );
        } else {
            trace!(key = %resolution.key, "No conflict");
        }
        self.record(&resolution);
        resolution
    }

    /// Candidate proposals in evaluation order.
    fn proposals(&self, ctx: &ConflictContext) -> Vec<Proposal> {
        let mut out = Vec::new();

        if let (Some(inc), Some(ext)) = (extract_timestamp(&ctx.incoming), extract_timestamp(&ctx.existing)) {
            if inc != ext {
                out.push(pick(
                    ResolutionStrategy::TimestampPriority,
                    inc > ext,
                    ctx,
                    format!("newer update time ({} vs {})", inc.max(ext), inc.min(ext)),
                ));
            }
        }

        if let (Some(inc), Some(ext)) = (extract_version(&ctx.incoming), extract_version(&ctx.existing)) {
            if inc != ext {
                out.push(pick(
                    ResolutionStrategy::VersionPriority,
                    inc > ext,
                    ctx,
                    format!("higher version ({} vs {})", inc.max(ext), inc.min(ext)),
                ));
            }
        }

        let source_winner = match ctx.existing_source {
            Some(existing) if existing.rank() != ctx.source.rank() => {
                Some(ctx.source.rank() > existing.rank())
            }
            None if ctx.source == SourceChannel::Subscription => Some(true),
            _ => None,
        };
        if let Some(incoming_wins) = source_winner {
            out.push(pick(
                ResolutionStrategy::SourcePriority,
                incoming_wins,
                ctx,
                "durable channel preferred".to_string(),
            ));
        }

        let inc_score = self.integrity_score(&ctx.incoming, &ctx.existing);
        let ext_score = self.integrity_score(&ctx.existing, &ctx.incoming);
        if (inc_score - ext_score).abs() > f64::EPSILON {
            out.push(pick(
                ResolutionStrategy::DataIntegrity,
                inc_score > ext_score,
                ctx,
                format!("integrity score {:.3} vs {:.3}", inc_score.max(ext_score), inc_score.min(ext_score)),
            ));
        }

        if let Some(merged) = smart_merge(&ctx.incoming, &ctx.existing) {
            if merged != ctx.incoming && merged != ctx.existing {
                out.push(Proposal {
                    strategy: ResolutionStrategy::SmartMerge,
                    winner: Winner::Merged,
                    value: merged,
                    reason: "field-wise merge".to_string(),
                });
            }
        }

        out
    }

    /// Weighted integrity score in [0, 1]. `other` widens the key universe
    /// used for completeness.
    pub fn integrity_score(&self, value: &Value, other: &Value) -> f64 {
        let Some(obj) = value.as_object() else {
            return 0.0;
        };

        let required = if self.required_fields.is_empty() {
            1.0
        } else {
            let present = self
                .required_fields
                .iter()
                .filter(|f| obj.get(f.as_str()).map(|v| !v.is_null()).unwrap_or(false))
                .count();
            present as f64 / self.required_fields.len() as f64
        };

        let mut keys: BTreeSet<&str> = obj.keys().map(String::as_str).collect();
        if let Some(other) = other.as_object() {
            keys.extend(other.keys().map(String::as_str));
        }
        let completeness = if keys.is_empty() {
            1.0
        } else {
            let filled = keys
                .iter()
                .filter(|k| obj.get(**k).map(|v| !v.is_null()).unwrap_or(false))
                .count();
            filled as f64 / keys.len() as f64
        };

        let numeric = if self.numeric_fields.is_empty() {
            1.0
        } else {
            let valid = self
                .numeric_fields
                .iter()
                .filter(|f| {
                    obj.get(f.as_str())
                        .and_then(as_decimal)
                        .map(|d| d >= Decimal::ZERO)
                        .unwrap_or(false)
                })
                .count();
            valid as f64 / self.numeric_fields.len() as f64
        };

        0.5 * required + 0.3 * completeness + 0.2 * numeric
    }

    fn record(&self, resolution: &ConflictResolution) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        state.metrics.total += 1;
        state.latency_total_us += resolution.latency_us;
        state.metrics.mean_latency_us = state.latency_total_us as f64 / state.metrics.total as f64;
        *state.metrics.by_strategy.entry(resolution.strategy).or_insert(0) += 1;
        if let Some(kind) = resolution.conflict_type {
            state.metrics.conflicts += 1;
            *state.metrics.by_type.entry(kind).or_insert(0) += 1;
        }
        match resolution.winner {
            Winner::Incoming => state.metrics.incoming_wins += 1,
            Winner::Existing => state.metrics.existing_wins += 1,
            Winner::Merged => state.metrics.merges += 1,
        }

        state.history.push_back(resolution.clone());
        while state.history.len() > self.history_limit {
            state.history.pop_front();
        }
    }

    /// Most recent resolutions, newest last.
    pub fn history(&self, limit: usize) -> Vec<ConflictResolution> {
        let state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let skip = state.history.len().saturating_sub(limit);
        state.history.iter().skip(skip).cloned().collect()
    }

    pub fn history_len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .history
            .len()
    }

    pub fn metrics(&self) -> ResolverMetrics {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .metrics
            .clone()
    }
}

fn pick(strategy: ResolutionStrategy, incoming_wins: bool, ctx: &ConflictContext, reason: String) -> Proposal {
    if incoming_wins {
        Proposal {
            strategy,
            winner: Winner::Incoming,
            value: ctx.incoming.clone(),
            reason,
        }
    } else {
        Proposal {
            strategy,
            winner: Winner::Existing,
            value: ctx.existing.clone(),
            reason,
        }
    }
}

fn classify(incoming: &Value, existing: &Value) -> ConflictType {
    let field = |v: &Value, name: &str| v.get(name).filter(|x| !x.is_null()).cloned();

    if let (Some(a), Some(b)) = (field(incoming, STATUS_FIELD), field(existing, STATUS_FIELD)) {
        if a != b {
            return ConflictType::StatusMismatch;
        }
    }
    if let (Some(a), Some(b)) = (extract_version(incoming), extract_version(existing)) {
        if a != b {
            return ConflictType::VersionMismatch;
        }
    }
    let present = |v: &Value| -> BTreeSet<String> {
        v.as_object()
            .map(|o| {
                o.iter()
                    .filter(|(_, x)| !x.is_null())
                    .map(|(k, _)| k.clone())
                    .collect()
            })
            .unwrap_or_default()
    };
    if present(incoming) != present(existing) {
        ConflictType::MissingFields
    } else {
        ConflictType::ValueMismatch
    }
}

fn as_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.to_string().parse().ok(),
        _ => None,
    }
}

fn parse_time(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

/// Update time of a record, from the first recognised field.
pub fn extract_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    TIMESTAMP_FIELDS
        .iter()
        .find_map(|f| value.get(*f).and_then(parse_time))
}

/// Monotonic version of a record, from the first recognised field.
pub fn extract_version(value: &Value) -> Option<u64> {
    VERSION_FIELDS.iter().find_map(|f| {
        value.get(*f).and_then(|v| match v {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
    })
}

fn is_time_field(key: &str) -> bool {
    TIMESTAMP_FIELDS.contains(&key) || key.ends_with("_at") || key.ends_with("At")
}

/// Field-wise merge of two objects. Non-null values beat nulls; timestamp-like
/// fields take the later time; other disagreements follow the newer record,
/// or the incoming one when neither carries a time.
fn smart_merge(incoming: &Value, existing: &Value) -> Option<Value> {
    let (inc, ext) = (incoming.as_object()?, existing.as_object()?);
    let incoming_newer = match (extract_timestamp(incoming), extract_timestamp(existing)) {
        (Some(a), Some(b)) => a >= b,
        (None, Some(_)) => false,
        _ => true,
    };

    let keys: BTreeSet<&String> = inc.keys().chain(ext.keys()).collect();
    let mut merged = Map::new();
    for key in keys {
        let a = inc.get(key).filter(|v| !v.is_null());
        let b = ext.get(key).filter(|v| !v.is_null());
        let value = match (a, b) {
            (Some(a), None) => a.clone(),
            (None, Some(b)) => b.clone(),
            (None, None) => Value::Null,
            (Some(a), Some(b)) if a == b => a.clone(),
            (Some(a), Some(b)) if is_time_field(key) => match (parse_time(a), parse_time(b)) {
                (Some(ta), Some(tb)) if tb > ta => b.clone(),
                (Some(_), Some(_)) => a.clone(),
                _ if incoming_newer => a.clone(),
                _ => b.clone(),
            },
            (Some(a), Some(b)) => {
                if incoming_newer {
                    a.clone()
                } else {
                    b.clone()
                }
            }
        };
        merged.insert(key.clone(), value);
    }
    Some(Value::Object(merged))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resolver() -> ConflictResolver {
        ConflictResolver::new(1000)
    }

    #[test]
    fn test_identical_is_no_conflict() {
        let r = resolver();
        let value = json!({"id": "p1", "status": "open"});
        let resolution = r.resolve("p1", value.clone(), value.clone(), SourceChannel::Transport);
        assert_eq!(resolution.strategy, ResolutionStrategy::NoConflict);
        assert_eq!(resolution.confidence, 1.0);
        assert!(resolution.conflict_type.is_none());
        assert_eq!(resolution.value, value);
    }

    #[test]
    fn test_newer_timestamp_wins() {
        let r = resolver();
        let existing = json!({"id": "p1", "status": "open", "updatedAt": "2026-01-05T10:00:00Z"});
        let incoming = json!({"id": "p1", "status": "open", "updatedAt": "2026-01-05T10:00:05Z"});

        let resolution = r.resolve("p1", incoming.clone(), existing, SourceChannel::Transport);
        assert_eq!(resolution.strategy, ResolutionStrategy::TimestampPriority);
        assert_eq!(resolution.winner, Winner::Incoming);
        assert_eq!(resolution.value, incoming);
        assert_eq!(resolution.conflict_type, Some(ConflictType::ValueMismatch));
    }

    #[test]
    fn test_older_duplicate_keeps_existing() {
        let r = resolver();
        let existing = json!({"id": "p1", "status": "closing", "updated_at": 1_767_607_205_000_i64});
        let incoming = json!({"id": "p1", "status": "open", "updated_at": 1_767_607_200_000_i64});

        let resolution = r.resolve("p1", incoming, existing.clone(), SourceChannel::Transport);
        assert!(resolution.keeps_existing());
        assert_eq!(resolution.value, existing);
        assert_eq!(resolution.conflict_type, Some(ConflictType::StatusMismatch));
    }

    #[test]
    fn test_version_beats_timestamp() {
        let r = resolver();
        let existing = json!({"id": "p1", "version": 4, "updated_at": "2026-01-05T10:00:00Z"});
        let incoming = json!({"id": "p1", "version": 3, "updated_at": "2026-01-05T10:00:09Z"});

        let resolution = r.resolve("p1", incoming, existing.clone(), SourceChannel::Subscription);
        assert_eq!(resolution.strategy, ResolutionStrategy::VersionPriority);
        assert_eq!(resolution.confidence, 0.95);
        assert_eq!(resolution.value, existing);
    }

    #[test]
    fn test_integrity_prefers_complete_record() {
        let r = resolver();
        let complete = json!({
            "id": "p1", "status": "open", "account_id": "acc-1", "symbol": "EURUSD",
            "volume": "1.0", "entry_price": "1.1000", "current_price": "1.1010", "trail_width": "20"
        });
        let sparse = json!({"id": "p1", "status": "open", "volume": "1.0"});

        let resolution = r.resolve("p1", sparse, complete.clone(), SourceChannel::Transport);
        assert_eq!(resolution.strategy, ResolutionStrategy::DataIntegrity);
        assert_eq!(resolution.value, complete);
        assert_eq!(resolution.conflict_type, Some(ConflictType::MissingFields));
        assert!(r.integrity_score(&complete, &complete) > 0.99);
    }

    #[test]
    fn test_negative_numbers_lower_integrity() {
        let r = resolver();
        let good = json!({"id": "p1", "status": "open", "account_id": "a", "symbol": "EURUSD",
            "volume": "1", "entry_price": "1.1", "current_price": "1.1", "trail_width": "0"});
        let mut bad = good.clone();
        bad["volume"] = json!("-1");
        assert!(r.integrity_score(&good, &bad) > r.integrity_score(&bad, &good));
    }

    #[test]
    fn test_smart_merge_fills_gaps() {
        let r = resolver().with_required_fields(&[]).with_numeric_fields(&[]);
        let incoming = json!({"id": "p1", "current_price": "1.2", "ticket": null});
        let existing = json!({"id": "p1", "ticket": "T7"});

        // Same completeness when measured over the shared key set, so the
        // merge carries the decision.
        let resolution = r.resolve("p1", incoming, existing, SourceChannel::Transport);
        assert_eq!(resolution.strategy, ResolutionStrategy::SmartMerge);
        assert_eq!(resolution.value, json!({"id": "p1", "current_price": "1.2", "ticket": "T7"}));
        assert_eq!(resolution.winner, Winner::Merged);
    }

    #[test]
    fn test_source_priority_and_fallback() {
        let r = resolver().with_required_fields(&[]).with_numeric_fields(&[]);
        let a = json!({"id": "p1", "note": "a"});
        let b = json!({"id": "p1", "note": "b"});

        let from_feed = r.resolve_context(
            ConflictContext::new("p1", a.clone(), b.clone(), SourceChannel::Subscription)
                .with_existing_source(SourceChannel::Transport),
        );
        assert_eq!(from_feed.strategy, ResolutionStrategy::SourcePriority);
        assert_eq!(from_feed.value, a);

        let fallback = r.resolve_context(
            ConflictContext::new("p1", a.clone(), b, SourceChannel::Transport)
                .with_existing_source(SourceChannel::Transport),
        );
        assert_eq!(fallback.strategy, ResolutionStrategy::Fallback);
        assert_eq!(fallback.confidence, 0.1);
        assert_eq!(fallback.value, a);
    }

    #[test]
    fn test_history_bounded_and_metrics() {
        let r = ConflictResolver::new(3);
        for i in 0..5 {
            r.resolve(
                &format!("k{}", i),
                json!({"version": i + 1}),
                json!({"version": i}),
                SourceChannel::Transport,
            );
        }
        assert_eq!(r.history_len(), 3);
        assert_eq!(r.history(10).last().unwrap().key, "k4");

        let metrics = r.metrics();
        assert_eq!(metrics.total, 5);
        assert_eq!(metrics.conflicts, 5);
        assert_eq!(metrics.by_type.get(&ConflictType::VersionMismatch), Some(&5));
        assert_eq!(metrics.by_strategy.get(&ResolutionStrategy::VersionPriority), Some(&5));
        assert_eq!(metrics.incoming_wins, 5);
    }
}
