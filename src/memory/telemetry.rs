//! Optional GC telemetry, compiled in with the `gc-telemetry` feature.
//!
//! Tracks allocation volume per class and per-cycle collection metrics.
//! Disabled builds carry none of this: the heap's hooks compile away.

use std::collections::HashMap;
use std::fmt::Write as _;

use serde::Serialize;

use crate::memory::gc::GcStats;

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct ClassAllocStats {
    pub count: usize,
    pub words: usize,
}

/// Metrics for one completed collection cycle.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CycleMetrics {
    pub used_before_bytes: usize,
    pub used_after_bytes: usize,
    pub recovered_bytes: usize,
    pub marked_objects: usize,
    pub duration_micros: u64,
}

#[derive(Debug, Default)]
pub struct GcTelemetry {
    class_stats: HashMap<u32, ClassAllocStats>,
    cycles: Vec<CycleMetrics>,
    pending_used_before: Option<usize>,
    total_allocations: usize,
    total_allocated_words: usize,
}

impl GcTelemetry {
    pub fn new() -> GcTelemetry {
        GcTelemetry::default()
    }

    pub fn record_alloc(&mut self, class_index: u32, words: usize) {
        let entry = self.class_stats.entry(class_index).or_default();
        entry.count += 1;
        entry.words += words;
        self.total_allocations += 1;
        self.total_allocated_words += words;
    }

    pub fn begin_cycle(&mut self, used_before: usize) {
        self.pending_used_before = Some(used_before);
    }

    pub fn end_cycle(&mut self, stats: &GcStats) {
        let used_before = self
            .pending_used_before
            .take()
            .unwrap_or(stats.used_bytes + stats.recovered_bytes);
        self.cycles.push(CycleMetrics {
            used_before_bytes: used_before,
            used_after_bytes: stats.used_bytes,
            recovered_bytes: stats.recovered_bytes,
            marked_objects: stats.marked_objects,
            duration_micros: stats.duration_micros,
        });
    }

    pub fn cycles(&self) -> &[CycleMetrics] {
        &self.cycles
    }

    pub fn total_allocations(&self) -> usize {
        self.total_allocations
    }

    /// Formatted allocation table. `class_name` resolves a class index to
    /// a display name; unnamed indices render as `class#N`.
    pub fn report_allocation_stats<F>(&self, class_name: F) -> String
    where
        F: Fn(u32) -> Option<String>,
    {
        let mut rows: Vec<(String, ClassAllocStats)> = self
            .class_stats
            .iter()
            .map(|(idx, stats)| {
                let name = class_name(*idx).unwrap_or_else(|| format!("class#{}", idx));
                (name, *stats)
            })
            .collect();
        rows.sort_by(|a, b| b.1.words.cmp(&a.1.words).then(a.0.cmp(&b.0)));

        let mut out = String::new();
        let _ = writeln!(out, "=== GC Allocation Stats ===");
        let _ = writeln!(out, "{:<16} {:>10} {:>12}", "class", "count", "words");
        for (name, stats) in rows {
            let _ = writeln!(out, "{:<16} {:>10} {:>12}", name, stats.count, stats.words);
        }
        let _ = writeln!(
            out,
            "{:<16} {:>10} {:>12}",
            "total", self.total_allocations, self.total_allocated_words
        );
        out
    }

    /// Formatted per-cycle table.
    pub fn report_cycles(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "=== GC Cycles ===");
        let _ = writeln!(
            out,
            "{:>5} {:>12} {:>12} {:>12} {:>8} {:>8}",
            "cycle", "before", "after", "recovered", "marked", "usecs"
        );
        for (i, c) in self.cycles.iter().enumerate() {
            let _ = writeln!(
                out,
                "{:>5} {:>12} {:>12} {:>12} {:>8} {:>8}",
                i + 1,
                c.used_before_bytes,
                c.used_after_bytes,
                c.recovered_bytes,
                c.marked_objects,
                c.duration_micros
            );
        }
        out
    }
}
