use serde::{Deserialize, Serialize};

/// One activity sample. Append-only, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tick {
    pub reservation_id: String,

    /// Position in the reservation's tick sequence (0-based)
    pub seq: u64,

    /// Wall time this sample represents
    pub tick_ms: u64,

    /// Whether the consumer was attentive
    pub focus: bool,

    /// Fraction of the viewport visible, 0..=1
    pub visibility: f64,

    /// Engagement heuristic, 0..=1
    pub scroll: f64,

    pub recorded_at: u64,
}

/// Focused milliseconds and mean visibility over a tick sequence.
///
/// Visibility is averaged over every tick, focused or not; an empty sequence averages to 0.
pub fn attention_summary(ticks: &[Tick]) -> (u64, f64) {
    let focused_ms = ticks
        .iter()
        .filter(|t| t.focus)
        .fold(0u64, |acc, t| acc.saturating_add(t.tick_ms));
    let avg_visibility = if ticks.is_empty() {
        0.0
    } else {
        ticks.iter().map(|t| t.visibility).sum::<f64>() / ticks.len() as f64
    };
    (focused_ms, avg_visibility)
}
