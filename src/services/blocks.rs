use crate::config::WatchConfig;
use crate::models::{BatchWriteWarning, Event, EventRole, SessionBlock};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

/// Blocks plus the non-fatal signals raised while building them.
#[derive(Debug, Default)]
pub struct BlockOutput {
    pub blocks: Vec<SessionBlock>,
    pub warnings: Vec<BatchWriteWarning>,
}

impl BlockOutput {
    /// The single current block, if the newest block is still open.
    pub fn current(&self) -> Option<&SessionBlock> {
        self.blocks.last().filter(|b| b.is_open)
    }
}

/// Segments a time-ordered event stream into session blocks.
///
/// A new block starts on the first event, on an idle gap above the
/// configured threshold, or once the open block's age reaches the session
/// duration. Duplicate-timestamp clusters at the start of a block are
/// rewrite artifacts and excluded from counts; the same cluster mid-block is
/// counted but raises a [`BatchWriteWarning`].
pub struct SessionBlockBuilder {
    session_duration: Duration,
    idle_gap: Duration,
    batch_window: Duration,
    batch_tolerance_seconds: f64,
}

impl SessionBlockBuilder {
    pub fn new(config: &WatchConfig) -> Self {
        Self {
            session_duration: Duration::hours(config.session_duration_hours),
            idle_gap: Duration::seconds(config.idle_gap_seconds),
            batch_window: Duration::seconds(config.batch_window_seconds),
            batch_tolerance_seconds: config.batch_tolerance_seconds,
        }
    }

    /// Build blocks from events. Events are sorted here; callers may hand
    /// over merged streams from several sources in any order.
    pub fn build(&self, events: &[Event], now: DateTime<Utc>) -> BlockOutput {
        let mut output = BlockOutput::default();
        if events.is_empty() {
            return output;
        }

        let mut sorted: Vec<Event> = events.to_vec();
        sorted.sort_by_key(|e| e.timestamp);

        let mut segments: Vec<Vec<Event>> = Vec::new();
        for event in sorted {
            let needs_new = match segments.last() {
                None => true,
                Some(segment) => {
                    let start = segment[0].timestamp;
                    let last = segment[segment.len() - 1].timestamp;
                    event.timestamp - start >= self.session_duration
                        || event.timestamp - last > self.idle_gap
                }
            };
            if needs_new {
                segments.push(Vec::new());
            }
            segments.last_mut().unwrap().push(event);
        }

        let count = segments.len();
        for (index, mut segment) in segments.into_iter().enumerate() {
            let start = segment[0].timestamp;
            let block_id = start.to_rfc3339();
            self.flag_artifacts(&block_id, &mut segment, &mut output.warnings);

            let is_last = index + 1 == count;
            output
                .blocks
                .push(self.assemble(block_id, segment, now, is_last));
        }
        output
    }

    /// Mark batch-write artifacts in place and collect mid-block warnings.
    ///
    /// A cluster is a chain of countable user prompts each within the
    /// timestamp tolerance of the previous one. Clusters that begin inside
    /// the batch window keep only their chronologically last event.
    fn flag_artifacts(
        &self,
        block_id: &str,
        segment: &mut [Event],
        warnings: &mut Vec<BatchWriteWarning>,
    ) {
        let block_start = segment[0].timestamp;
        let window_end = block_start + self.batch_window;

        let prompt_indexes: Vec<usize> = segment
            .iter()
            .enumerate()
            .filter(|(_, e)| e.role == EventRole::User && !e.tool_result)
            .map(|(i, _)| i)
            .collect();

        let mut cluster: Vec<usize> = Vec::new();
        for &index in prompt_indexes.iter() {
            let chained = cluster.last().map_or(false, |&prev| {
                let gap = segment[index].timestamp - segment[prev].timestamp;
                (gap.num_milliseconds() as f64 / 1000.0) <= self.batch_tolerance_seconds
            });
            if !chained {
                self.close_cluster(block_id, segment, &cluster, window_end, warnings);
                cluster.clear();
            }
            cluster.push(index);
        }
        self.close_cluster(block_id, segment, &cluster, window_end, warnings);
    }

    fn close_cluster(
        &self,
        block_id: &str,
        segment: &mut [Event],
        cluster: &[usize],
        window_end: DateTime<Utc>,
        warnings: &mut Vec<BatchWriteWarning>,
    ) {
        if cluster.len() < 2 {
            return;
        }
        let first = cluster[0];
        if segment[first].timestamp <= window_end {
            // Rewrite artifact: everything but the chronologically last
            // event is excluded from counts but retained for audit.
            for &index in &cluster[..cluster.len() - 1] {
                segment[index].artifact = true;
            }
        } else {
            warnings.push(BatchWriteWarning {
                block_id: block_id.to_string(),
                at: segment[first].timestamp,
                cluster_size: cluster.len(),
            });
        }
    }

    fn assemble(
        &self,
        id: String,
        events: Vec<Event>,
        now: DateTime<Utc>,
        is_last: bool,
    ) -> SessionBlock {
        let start_time = events[0].timestamp;
        let end_time = start_time + self.session_duration;
        let actual_end = events[events.len() - 1].timestamp;

        let mut user_prompts = 0u32;
        let mut assistant_messages = 0u32;
        let mut total_size_units = 0u64;
        let mut per_model_size: HashMap<String, u64> = HashMap::new();
        let mut artifacts = 0u32;

        for event in &events {
            if event.artifact {
                artifacts += 1;
                continue;
            }
            match event.role {
                EventRole::User => {
                    if !event.tool_result {
                        user_prompts += 1;
                    }
                }
                EventRole::Assistant => assistant_messages += 1,
                EventRole::System => {}
            }
            total_size_units += event.size_units;
            if let Some(model) = &event.model {
                *per_model_size.entry(model.clone()).or_insert(0) += event.size_units;
            }
        }

        // Only the newest block can be current; older ones were superseded.
        let is_open = is_last && now < end_time;

        SessionBlock {
            id,
            start_time,
            end_time,
            actual_end,
            events,
            user_prompts,
            assistant_messages,
            total_size_units,
            per_model_size,
            artifacts,
            is_open,
        }
    }
}
