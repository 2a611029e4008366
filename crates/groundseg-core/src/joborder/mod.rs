// Copyright (C) 2025 The groundseg Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job order descriptors handed to processors.
//!
//! | Item | Purpose |
//! |------|---------|
//! | [`JobOrder`] | In-memory descriptor |
//! | [`JobOrder::to_xml`] / [`JobOrder::from_xml`] | Wire format (`Ipf_Job_Order`) |
//! | [`JobOrderBuilder`] | Deterministic construction from a job step |

mod builder;
mod xml;

pub use builder::{JobOrderBuilder, JobOrderInput, output_file_name};

use chrono::{DateTime, Utc};

/// Descriptor consumed by a processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOrder {
    pub conf: JobOrderConf,
    pub tasks: Vec<ProcessingTask>,
}

/// `Ipf_Conf` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOrderConf {
    pub processor_name: String,
    pub version: String,
    pub stdout_log_level: String,
    pub stderr_log_level: String,
    pub test: bool,
    pub breakpoint_enable: bool,
    pub processing_station: String,
    pub processing_mode: Option<String>,
    pub config_files: Vec<String>,
    pub sensing_time: Option<SensingTime>,
    pub dynamic_parameters: Vec<ProcessingParameter>,
}

/// Sensing interval, microsecond precision on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensingTime {
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingParameter {
    pub name: String,
    pub value: String,
}

/// `Ipf_Proc` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingTask {
    pub task_name: String,
    pub task_version: String,
    pub inputs: Vec<FileReference>,
    pub outputs: Vec<FileReference>,
}

/// Input or output file group of one product type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReference {
    pub file_type: String,
    pub file_name_type: Option<String>,
    pub file_names: Vec<String>,
}
