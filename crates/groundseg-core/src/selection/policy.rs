// Copyright (C) 2025 The groundseg Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Policy evaluation over candidate products.

use std::cmp::Ordering;

use crate::model::{Product, SensingWindow};
use crate::persistence::ProductQuery;

use super::rule::{PolicyKind, SelectionPolicy};

impl SelectionPolicy {
    /// Job window widened by the policy deltas.
    pub fn window(&self, job: &SensingWindow) -> SensingWindow {
        SensingWindow::new(job.start - self.delta_before, job.stop + self.delta_after)
    }

    /// Catalog lookup that returns every product this policy can pick for
    /// `job`, so [`select`](Self::select) never sees the whole class history.
    pub fn query(&self, job: &SensingWindow) -> ProductQuery {
        let window = self.window(job);
        match self.kind {
            PolicyKind::ValIntersect => ProductQuery::Intersecting(window),
            PolicyKind::LatestValIntersect => ProductQuery::NewestIntersecting(window),
            PolicyKind::LatestValCover => ProductQuery::NewestCovering(window),
            PolicyKind::LatestValidity => ProductQuery::LatestStart,
            PolicyKind::LatestValidityClosest => ProductQuery::NearestStart(window.centre()),
        }
    }

    /// Candidates satisfying this policy for `job`, in preference order.
    pub fn select<'a>(&self, job: &SensingWindow, candidates: &'a [Product]) -> Vec<&'a Product> {
        let window = self.window(job);
        let intersecting = candidates
            .iter()
            .filter(|p| p.sensing_window().intersects(&window));

        let mut selected: Vec<&Product> = match self.kind {
            PolicyKind::ValIntersect => intersecting.collect(),
            PolicyKind::LatestValIntersect => {
                intersecting.max_by(|a, b| newest(a, b)).into_iter().collect()
            }
            PolicyKind::LatestValCover => candidates
                .iter()
                .filter(|p| p.sensing_window().contains(&window))
                .max_by(|a, b| newest(a, b))
                .into_iter()
                .collect(),
            PolicyKind::LatestValidity => candidates
                .iter()
                .max_by(|a, b| {
                    a.sensing_start
                        .cmp(&b.sensing_start)
                        .then_with(|| newest(a, b))
                })
                .into_iter()
                .collect(),
            PolicyKind::LatestValidityClosest => {
                let centre = window.centre();
                candidates
                    .iter()
                    .min_by(|a, b| {
                        let da = (a.sensing_start - centre).abs();
                        let db = (b.sensing_start - centre).abs();
                        da.cmp(&db)
                            .then_with(|| b.sensing_start.cmp(&a.sensing_start))
                            .then_with(|| newest(b, a))
                    })
                    .into_iter()
                    .collect()
            }
        };

        order_candidates(job, &mut selected);
        selected
    }
}

/// Newer generation compares greater; ids break ties so results are stable.
fn newest(a: &Product, b: &Product) -> Ordering {
    a.generation_time
        .cmp(&b.generation_time)
        .then_with(|| b.id.cmp(&a.id))
}

/// Exact containment of the job window first, then most recent generation.
pub fn order_candidates(job: &SensingWindow, items: &mut [&Product]) {
    items.sort_by(|a, b| {
        let ca = a.sensing_window().contains(job);
        let cb = b.sensing_window().contains(job);
        cb.cmp(&ca)
            .then_with(|| newest(b, a))
            .then_with(|| a.sensing_start.cmp(&b.sensing_start))
    });
}

/// Percentage of `job` covered by the union of the items' sensing windows.
pub fn coverage_percent(job: &SensingWindow, items: &[&Product]) -> f64 {
    let total = job.duration().num_milliseconds();
    if total <= 0 {
        let covered = items
            .iter()
            .any(|p| p.sensing_start <= job.start && p.sensing_stop >= job.stop);
        return if covered { 100.0 } else { 0.0 };
    }

    let mut spans: Vec<(i64, i64)> = items
        .iter()
        .filter_map(|p| {
            let start = p.sensing_start.max(job.start);
            let stop = p.sensing_stop.min(job.stop);
            (start < stop).then(|| (start.timestamp_millis(), stop.timestamp_millis()))
        })
        .collect();
    spans.sort_unstable();

    let mut covered = 0i64;
    let mut cursor = i64::MIN;
    for (start, stop) in spans {
        let start = start.max(cursor);
        if stop > start {
            covered += stop - start;
            cursor = stop;
        }
    }

    covered as f64 * 100.0 / total as f64
}
