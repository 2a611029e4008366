// Copyright (C) 2025 The groundseg Authors
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::{BTreeMap, BTreeSet};

use chrono::SubsecRound;

use super::{FileReference, JobOrder, JobOrderConf, ProcessingParameter, ProcessingTask, SensingTime};
use crate::catalog::ConfiguredProcessor;
use crate::error::{CoreError, Result};
use crate::model::{Job, JobStep, ProcessingOrder, Product};

/// Everything needed to describe one job step execution.
#[derive(Debug, Clone)]
pub struct JobOrderInput<'a> {
    pub order: &'a ProcessingOrder,
    pub job: &'a Job,
    pub step: &'a JobStep,
    pub processor: &'a ConfiguredProcessor,
    /// Resolved input products and their storage paths.
    pub inputs: Vec<(&'a Product, String)>,
    /// Directory the processor writes its output into.
    pub output_directory: String,
}

/// Builds [`JobOrder`]s. Equal inputs always yield equal descriptors,
/// whatever order the inputs were resolved in.
#[derive(Debug, Clone)]
pub struct JobOrderBuilder {
    file_name_type: String,
}

impl Default for JobOrderBuilder {
    fn default() -> Self {
        Self {
            file_name_type: "Physical".to_string(),
        }
    }
}

impl JobOrderBuilder {
    pub fn new(file_name_type: impl Into<String>) -> Self {
        Self {
            file_name_type: file_name_type.into(),
        }
    }

    pub fn build(&self, input: &JobOrderInput<'_>) -> Result<JobOrder> {
        let JobOrderInput {
            order,
            job,
            step,
            processor,
            ..
        } = input;

        if step.job_id != job.id {
            return Err(CoreError::Descriptor {
                message: format!("job step {} does not belong to job {}", step.id, job.id),
            });
        }

        let mut parameters: BTreeMap<&str, &str> = processor
            .dynamic_parameters
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        for (k, v) in &order.dynamic_parameters {
            parameters.insert(k.as_str(), v.as_str());
        }

        let mut grouped: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for (product, path) in &input.inputs {
            grouped
                .entry(product.product_class.as_str())
                .or_default()
                .insert(path.as_str());
        }

        let inputs = grouped
            .into_iter()
            .map(|(file_type, paths)| FileReference {
                file_type: file_type.to_string(),
                file_name_type: Some(self.file_name_type.clone()),
                file_names: paths.into_iter().map(str::to_string).collect(),
            })
            .collect();

        let output = FileReference {
            file_type: step.product_class.clone(),
            file_name_type: Some(self.file_name_type.clone()),
            file_names: vec![format!(
                "{}/{}",
                input.output_directory.trim_end_matches('/'),
                output_file_name(step, job)
            )],
        };

        Ok(JobOrder {
            conf: JobOrderConf {
                processor_name: processor.processor_name.clone(),
                version: processor.version.clone(),
                stdout_log_level: processor.stdout_log_level.clone(),
                stderr_log_level: processor.stderr_log_level.clone(),
                test: processor.test,
                breakpoint_enable: false,
                processing_station: job.facility.clone(),
                processing_mode: order.processing_mode.clone(),
                config_files: processor.config_files.clone(),
                sensing_time: Some(SensingTime {
                    start: job.start_time.trunc_subsecs(6),
                    stop: job.stop_time.trunc_subsecs(6),
                }),
                dynamic_parameters: parameters
                    .into_iter()
                    .map(|(name, value)| ProcessingParameter {
                        name: name.to_string(),
                        value: value.to_string(),
                    })
                    .collect(),
            },
            tasks: vec![ProcessingTask {
                task_name: processor.processor_name.clone(),
                task_version: processor.version.clone(),
                inputs,
                outputs: vec![output],
            }],
        })
    }
}

/// Deterministic output file name of a job step.
pub fn output_file_name(step: &JobStep, job: &Job) -> String {
    format!(
        "{}_{}_{}_{}",
        step.product_class,
        job.start_time.format("%Y%m%dT%H%M%S"),
        job.stop_time.format("%Y%m%dT%H%M%S"),
        step.id
    )
}
