// Copyright (C) 2025 The groundseg Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Decomposition of an order into jobs and job steps.

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, TimeZone, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::catalog::MissionCatalog;
use crate::error::{CoreError, Result};
use crate::model::{Job, JobStep, JobStepState, ProcessingOrder, SensingWindow, SlicingType};

const MAX_SLICES: usize = 100_000;

/// Jobs and job steps of a planned order.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub jobs: Vec<Job>,
    pub steps: Vec<JobStep>,
}

fn invalid(field: &str, message: impl Into<String>) -> CoreError {
    CoreError::ValidationError {
        field: field.to_string(),
        message: message.into(),
    }
}

fn start_of_day(t: DateTime<Utc>) -> DateTime<Utc> {
    t.date_naive().and_hms_opt(0, 0, 0).unwrap_or_default().and_utc()
}

fn first_of(year: i32, month: u32) -> Result<DateTime<Utc>> {
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|d| Utc.from_utc_datetime(&d))
        .ok_or_else(|| invalid("start_time", "start time out of range"))
}

/// Sensing windows of the jobs of `order`.
pub fn slice_windows(order: &ProcessingOrder) -> Result<Vec<SensingWindow>> {
    let (start, stop) = (order.start_time, order.stop_time);
    if stop < start {
        return Err(invalid("stop_time", "stop time precedes start time"));
    }

    let (first, step): (DateTime<Utc>, Box<dyn Fn(DateTime<Utc>) -> Option<DateTime<Utc>>>) =
        match order.slicing_type {
            SlicingType::None => return Ok(vec![SensingWindow::new(start, stop)]),
            SlicingType::CalendarDay => (
                start_of_day(start),
                Box::new(|t: DateTime<Utc>| t.checked_add_signed(Duration::days(1))),
            ),
            SlicingType::CalendarMonth => (
                first_of(start.year(), start.month())?,
                Box::new(|t: DateTime<Utc>| t.checked_add_months(Months::new(1))),
            ),
            SlicingType::CalendarYear => (
                first_of(start.year(), 1)?,
                Box::new(|t: DateTime<Utc>| t.checked_add_months(Months::new(12))),
            ),
            SlicingType::TimeSlice => {
                let secs = order
                    .slice_duration_secs
                    .filter(|s| *s > 0)
                    .ok_or_else(|| {
                        invalid("slice_duration_secs", "time slicing needs a positive duration")
                    })?;
                let duration = Duration::seconds(secs);
                (
                    start,
                    Box::new(move |t: DateTime<Utc>| t.checked_add_signed(duration)),
                )
            }
        };

    if order.slice_overlap_secs < 0 {
        return Err(invalid("slice_overlap_secs", "overlap must not be negative"));
    }
    let half_overlap = Duration::seconds(order.slice_overlap_secs) / 2;
    let overlap = |w: SensingWindow| match order.slicing_type {
        SlicingType::TimeSlice => SensingWindow::new(w.start - half_overlap, w.stop + half_overlap),
        _ => w,
    };

    let mut windows = Vec::new();
    let mut slice_start = first;
    loop {
        let slice_stop = step(slice_start).ok_or_else(|| invalid("stop_time", "time out of range"))?;
        windows.push(overlap(SensingWindow::new(slice_start, slice_stop)));
        if windows.len() > MAX_SLICES {
            return Err(invalid("slicing_type", "order produces too many slices"));
        }
        slice_start = slice_stop;
        if slice_start >= stop {
            break;
        }
    }
    Ok(windows)
}

/// Build the plan of `order`: one job per slice, one step per requested class.
///
/// Unknown product classes are validation errors; unparseable selection
/// rules are configuration errors. Both fail the order.
pub fn decompose(
    order: &ProcessingOrder,
    catalog: &MissionCatalog,
    now: DateTime<Utc>,
) -> Result<Plan> {
    if order.mission_code != catalog.mission_code {
        return Err(invalid(
            "mission_code",
            format!(
                "order belongs to mission {}, catalog is for {}",
                order.mission_code, catalog.mission_code
            ),
        ));
    }
    if order.requested_product_classes.is_empty() {
        return Err(invalid(
            "requested_product_classes",
            "at least one product class must be requested",
        ));
    }

    let mut processors = Vec::with_capacity(order.requested_product_classes.len());
    for class in &order.requested_product_classes {
        let product_class = catalog.product_class(class).ok_or_else(|| {
            invalid(
                "requested_product_classes",
                format!("unknown product class '{}'", class),
            )
        })?;
        if catalog.processor(&product_class.processor).is_none() {
            return Err(invalid(
                "requested_product_classes",
                format!("product class '{}' has no configured processor", class),
            ));
        }
        catalog.selection_rules(class)?;
        processors.push((class.clone(), product_class.processor.clone()));
    }

    let windows = slice_windows(order)?;
    let mut plan = Plan::default();
    for (slice_index, window) in windows.into_iter().enumerate() {
        let job = Job {
            id: Uuid::new_v4().to_string(),
            order_id: order.id.clone(),
            facility: order.facility.clone(),
            state: JobStepState::Initial,
            version: 0,
            slice_index: slice_index as i32,
            start_time: window.start,
            stop_time: window.stop,
            created_at: now,
            updated_at: now,
        };
        for (step_index, (class, processor)) in processors.iter().enumerate() {
            plan.steps.push(JobStep {
                id: Uuid::new_v4().to_string(),
                job_id: job.id.clone(),
                order_id: order.id.clone(),
                step_index: step_index as i32,
                product_class: class.clone(),
                processor: processor.clone(),
                state: JobStepState::Initial,
                version: 0,
                retry_count: 0,
                max_attempts: order.max_step_attempts,
                input_products: Vec::new(),
                execution_handle: None,
                joborder_location: None,
                diagnostic_kind: None,
                diagnostic_code: None,
                diagnostic_message: None,
                started_at: None,
                finished_at: None,
                created_at: now,
                updated_at: now,
            });
        }
        plan.jobs.push(job);
    }

    debug!(
        order_id = %order.id,
        jobs = plan.jobs.len(),
        steps = plan.steps.len(),
        "Order decomposed"
    );
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OrderState;
    use std::collections::BTreeMap;

    const CATALOG: &str = r#"{
        "mission_code": "S5P",
        "product_classes": [
            {"product_type": "L2_O3", "processor": "o3"},
            {"product_type": "L2_NO2", "processor": "no2",
             "selection_rules": "FOR L1B SELECT ValIntersect(0, 0)"}
        ],
        "processors": [
            {"identifier": "o3", "processor_name": "O3", "version": "1", "image": "o3:1"},
            {"identifier": "no2", "processor_name": "NO2", "version": "1", "image": "no2:1"}
        ]
    }"#;

    fn order(slicing: SlicingType, start: DateTime<Utc>, stop: DateTime<Utc>) -> ProcessingOrder {
        ProcessingOrder {
            id: "order-1".to_string(),
            identifier: "O".to_string(),
            mission_code: "S5P".to_string(),
            state: OrderState::Approved,
            version: 1,
            start_time: start,
            stop_time: stop,
            slicing_type: slicing,
            slice_duration_secs: None,
            slice_overlap_secs: 0,
            requested_product_classes: vec!["L2_O3".to_string(), "L2_NO2".to_string()],
            facility: "localhost".to_string(),
            processing_mode: None,
            dynamic_parameters: BTreeMap::new(),
            tolerate_partial_failure: false,
            max_step_attempts: 3,
            state_message: None,
            diagnostic_kind: None,
            diagnostic_code: None,
            failed_job_step_id: None,
            created_at: start,
            updated_at: start,
            eviction_time: None,
        }
    }

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    #[test]
    fn test_calendar_day_slices_cover_whole_days() {
        let o = order(SlicingType::CalendarDay, at(2024, 2, 28, 6), at(2024, 3, 1, 3));
        let windows = slice_windows(&o).unwrap();
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[0].start, at(2024, 2, 28, 0));
        assert_eq!(windows[2].stop, at(2024, 3, 2, 0));
    }

    #[test]
    fn test_calendar_month_and_year() {
        let o = order(SlicingType::CalendarMonth, at(2024, 1, 15, 0), at(2024, 3, 1, 0));
        let windows = slice_windows(&o).unwrap();
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[1].start, at(2024, 2, 1, 0));
        assert_eq!(windows[1].stop, at(2024, 3, 1, 0));

        let o = order(SlicingType::CalendarYear, at(2024, 6, 1, 0), at(2024, 6, 1, 0));
        assert_eq!(
            slice_windows(&o).unwrap(),
            vec![SensingWindow::new(at(2024, 1, 1, 0), at(2025, 1, 1, 0))]
        );
    }

    #[test]
    fn test_time_slices_with_overlap() {
        let mut o = order(SlicingType::TimeSlice, at(2024, 1, 1, 0), at(2024, 1, 1, 12));
        o.slice_duration_secs = Some(6 * 3600);
        o.slice_overlap_secs = 3600;
        let windows = slice_windows(&o).unwrap();
        assert_eq!(windows.len(), 2);
        assert_eq!(
            windows[1].start,
            at(2024, 1, 1, 6) - Duration::minutes(30)
        );
        assert_eq!(windows[1].stop, at(2024, 1, 1, 12) + Duration::minutes(30));

        o.slice_duration_secs = None;
        assert!(slice_windows(&o).is_err());
    }

    #[test]
    fn test_decompose_yields_one_step_per_class_and_slice() {
        let catalog = MissionCatalog::from_json(CATALOG).unwrap();
        let mut o = order(SlicingType::TimeSlice, at(2024, 1, 1, 0), at(2024, 1, 1, 12));
        o.slice_duration_secs = Some(4 * 3600);

        let plan = decompose(&o, &catalog, Utc::now()).unwrap();
        assert_eq!(plan.jobs.len(), 3);
        assert_eq!(plan.steps.len(), 6);
        for job in &plan.jobs {
            let classes: Vec<_> = plan
                .steps
                .iter()
                .filter(|s| s.job_id == job.id)
                .map(|s| s.product_class.as_str())
                .collect();
            assert_eq!(classes, vec!["L2_O3", "L2_NO2"]);
        }
        assert!(plan.steps.iter().all(|s| s.max_attempts == 3));
    }

    #[test]
    fn test_decompose_rejects_unknown_class() {
        let catalog = MissionCatalog::from_json(CATALOG).unwrap();
        let mut o = order(SlicingType::None, at(2024, 1, 1, 0), at(2024, 1, 2, 0));
        o.requested_product_classes = vec!["L3".to_string()];
        let err = decompose(&o, &catalog, Utc::now()).unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");

        let o = order(SlicingType::None, at(2024, 1, 2, 0), at(2024, 1, 1, 0));
        assert!(decompose(&o, &catalog, Utc::now()).is_err());
    }
}
