// Copyright (C) 2025 The groundseg Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `Ipf_Job_Order` XML rendering and parsing.

use std::fmt::Write as _;

use chrono::{DateTime, NaiveDateTime, Utc};

use super::{FileReference, JobOrder, JobOrderConf, ProcessingParameter, ProcessingTask, SensingTime};
use crate::error::{CoreError, Result};

const TIME_FORMAT: &str = "%Y%m%d_%H%M%S%6f";

fn descriptor_error(message: impl Into<String>) -> CoreError {
    CoreError::Descriptor {
        message: message.into(),
    }
}

// ============================================================================
// Rendering
// ============================================================================

struct XmlWriter {
    out: String,
    depth: usize,
}

impl XmlWriter {
    fn new() -> Self {
        Self {
            out: String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n"),
            depth: 0,
        }
    }

    fn indent(&mut self) {
        for _ in 0..self.depth {
            self.out.push_str("  ");
        }
    }

    fn open(&mut self, name: &str, count: Option<usize>) {
        self.indent();
        match count {
            Some(n) => {
                let _ = writeln!(self.out, "<{} count=\"{}\">", name, n);
            }
            None => {
                let _ = writeln!(self.out, "<{}>", name);
            }
        }
        self.depth += 1;
    }

    fn close(&mut self, name: &str) {
        self.depth -= 1;
        self.indent();
        let _ = writeln!(self.out, "</{}>", name);
    }

    /// Write `<name>text</name>`. Text is written exactly, so a parser
    /// reads back the same string.
    fn leaf(&mut self, name: &str, text: &str) -> Result<()> {
        self.indent();
        let _ = write!(self.out, "<{}>", name);
        escape_into(&mut self.out, name, text)?;
        let _ = writeln!(self.out, "</{}>", name);
        Ok(())
    }
}

fn escape_into(out: &mut String, element: &str, text: &str) -> Result<()> {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            // A literal CR would be folded into LF by the parser.
            '\r' => out.push_str("&#13;"),
            '\t' | '\n' => out.push(c),
            c if is_xml_char(c) => out.push(c),
            c => {
                return Err(descriptor_error(format!(
                    "{} contains U+{:04X}, which XML 1.0 cannot carry",
                    element, c as u32
                )));
            }
        }
    }
    Ok(())
}

fn is_xml_char(c: char) -> bool {
    matches!(c, '\u{20}'..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}' | '\u{10000}'..='\u{10FFFF}')
}

fn format_time(time: &DateTime<Utc>) -> String {
    time.format(TIME_FORMAT).to_string()
}

impl JobOrder {
    /// Render the descriptor. Output is byte-identical for equal descriptors.
    pub fn to_xml(&self) -> Result<String> {
        let mut w = XmlWriter::new();
        w.open("Ipf_Job_Order", None);

        let conf = &self.conf;
        w.open("Ipf_Conf", None);
        w.leaf("Processor_Name", &conf.processor_name)?;
        w.leaf("Version", &conf.version)?;
        w.leaf("Stdout_Log_Level", &conf.stdout_log_level)?;
        w.leaf("Stderr_Log_Level", &conf.stderr_log_level)?;
        w.leaf("Test", if conf.test { "true" } else { "false" })?;
        w.leaf(
            "Breakpoint_Enable",
            if conf.breakpoint_enable { "true" } else { "false" },
        )?;
        w.leaf("Processing_Station", &conf.processing_station)?;
        if let Some(mode) = &conf.processing_mode {
            w.leaf("Processing_Mode", mode)?;
        }
        w.open("List_of_Config_Files", Some(conf.config_files.len()));
        for file in &conf.config_files {
            w.leaf("Config_File", file)?;
        }
        w.close("List_of_Config_Files");
        if let Some(sensing) = &conf.sensing_time {
            w.open("Sensing_Time", None);
            w.leaf("Start", &format_time(&sensing.start))?;
            w.leaf("Stop", &format_time(&sensing.stop))?;
            w.close("Sensing_Time");
        }
        w.open(
            "List_of_Dyn_Processing_Parameters",
            Some(conf.dynamic_parameters.len()),
        );
        for param in &conf.dynamic_parameters {
            w.open("Processing_Parameter", None);
            w.leaf("Name", &param.name)?;
            w.leaf("Value", &param.value)?;
            w.close("Processing_Parameter");
        }
        w.close("List_of_Dyn_Processing_Parameters");
        w.close("Ipf_Conf");

        w.open("List_of_Ipf_Procs", Some(self.tasks.len()));
        for task in &self.tasks {
            w.open("Ipf_Proc", None);
            w.leaf("Task_Name", &task.task_name)?;
            w.leaf("Task_Version", &task.task_version)?;

            w.open("List_of_Inputs", Some(task.inputs.len()));
            for input in &task.inputs {
                w.open("Input", None);
                w.leaf("File_Type", &input.file_type)?;
                if let Some(name_type) = &input.file_name_type {
                    w.leaf("File_Name_Type", name_type)?;
                }
                w.open("List_of_File_Names", Some(input.file_names.len()));
                for name in &input.file_names {
                    w.leaf("File_Name", name)?;
                }
                w.close("List_of_File_Names");
                w.close("Input");
            }
            w.close("List_of_Inputs");

            w.open("List_of_Outputs", Some(task.outputs.len()));
            for output in &task.outputs {
                let name = match output.file_names.as_slice() {
                    [name] => name,
                    names => {
                        return Err(descriptor_error(format!(
                            "output {} must name exactly one file, got {}",
                            output.file_type,
                            names.len()
                        )));
                    }
                };
                w.open("Output", None);
                w.leaf("File_Type", &output.file_type)?;
                if let Some(name_type) = &output.file_name_type {
                    w.leaf("File_Name_Type", name_type)?;
                }
                w.leaf("File_Name", name)?;
                w.close("Output");
            }
            w.close("List_of_Outputs");
            w.close("Ipf_Proc");
        }
        w.close("List_of_Ipf_Procs");

        w.close("Ipf_Job_Order");
        Ok(w.out)
    }

    /// Parse a descriptor. Element names are matched case-insensitively.
    pub fn from_xml(xml: &str) -> Result<JobOrder> {
        let doc = roxmltree::Document::parse(xml)
            .map_err(|e| descriptor_error(format!("malformed XML: {}", e)))?;
        let root = doc.root_element();
        if !is(root, "Ipf_Job_Order") {
            return Err(descriptor_error(format!(
                "unexpected root element '{}'",
                root.tag_name().name()
            )));
        }

        let conf_node = required(root, "Ipf_Conf")?;
        let conf = parse_conf(conf_node)?;

        let mut tasks = Vec::new();
        if let Some(procs) = child(root, "List_of_Ipf_Procs") {
            for proc_node in children(procs, "Ipf_Proc") {
                tasks.push(parse_task(proc_node)?);
            }
        }

        Ok(JobOrder { conf, tasks })
    }
}

// ============================================================================
// Parsing
// ============================================================================

type Node<'a, 'input> = roxmltree::Node<'a, 'input>;

fn is(node: Node, name: &str) -> bool {
    node.is_element() && node.tag_name().name().eq_ignore_ascii_case(name)
}

fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children().find(|n| is(*n, name))
}

fn children<'a, 'input: 'a>(
    node: Node<'a, 'input>,
    name: &'a str,
) -> impl Iterator<Item = Node<'a, 'input>> + 'a {
    node.children().filter(move |n| is(*n, name))
}

fn required<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Result<Node<'a, 'input>> {
    child(node, name).ok_or_else(|| {
        descriptor_error(format!(
            "missing element {} in {}",
            name,
            node.tag_name().name()
        ))
    })
}

/// Concatenated text of an element, exactly as written. Comments and
/// processing instructions inside the element are skipped.
fn text(node: Node) -> String {
    node.children()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .collect()
}

fn required_text(node: Node, name: &str) -> Result<String> {
    required(node, name).map(text)
}

fn optional_text(node: Node, name: &str) -> Option<String> {
    child(node, name).map(text)
}

fn parse_bool(node: Node, name: &str) -> Result<bool> {
    match optional_text(node, name).as_deref().map(str::trim) {
        None => Ok(false),
        Some(v) if v.eq_ignore_ascii_case("true") => Ok(true),
        Some(v) if v.eq_ignore_ascii_case("false") => Ok(false),
        Some(other) => Err(descriptor_error(format!(
            "{} must be true or false, got '{}'",
            name, other
        ))),
    }
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    let value = value.trim();
    NaiveDateTime::parse_from_str(value, TIME_FORMAT)
        .map(|t| t.and_utc())
        .map_err(|e| descriptor_error(format!("invalid time '{}': {}", value, e)))
}

fn parse_conf(node: Node) -> Result<JobOrderConf> {
    let config_files = child(node, "List_of_Config_Files")
        .map(|list| children(list, "Config_File").map(text).collect())
        .unwrap_or_default();

    let sensing_time = match child(node, "Sensing_Time") {
        Some(sensing) => Some(SensingTime {
            start: parse_time(&required_text(sensing, "Start")?)?,
            stop: parse_time(&required_text(sensing, "Stop")?)?,
        }),
        None => None,
    };

    let mut dynamic_parameters = Vec::new();
    if let Some(list) = child(node, "List_of_Dyn_Processing_Parameters") {
        for param in children(list, "Processing_Parameter") {
            dynamic_parameters.push(ProcessingParameter {
                name: required_text(param, "Name")?,
                value: optional_text(param, "Value").unwrap_or_default(),
            });
        }
    }

    Ok(JobOrderConf {
        processor_name: required_text(node, "Processor_Name")?,
        version: required_text(node, "Version")?,
        stdout_log_level: optional_text(node, "Stdout_Log_Level").unwrap_or_default(),
        stderr_log_level: optional_text(node, "Stderr_Log_Level").unwrap_or_default(),
        test: parse_bool(node, "Test")?,
        breakpoint_enable: parse_bool(node, "Breakpoint_Enable")?,
        processing_station: optional_text(node, "Processing_Station").unwrap_or_default(),
        processing_mode: optional_text(node, "Processing_Mode"),
        config_files,
        sensing_time,
        dynamic_parameters,
    })
}

fn parse_task(node: Node) -> Result<ProcessingTask> {
    let mut inputs = Vec::new();
    if let Some(list) = child(node, "List_of_Inputs") {
        for input in children(list, "Input") {
            let file_names = child(input, "List_of_File_Names")
                .map(|names| children(names, "File_Name").map(text).collect())
                .unwrap_or_default();
            inputs.push(FileReference {
                file_type: required_text(input, "File_Type")?,
                file_name_type: optional_text(input, "File_Name_Type"),
                file_names,
            });
        }
    }

    let mut outputs = Vec::new();
    if let Some(list) = child(node, "List_of_Outputs") {
        for output in children(list, "Output") {
            outputs.push(FileReference {
                file_type: required_text(output, "File_Type")?,
                file_name_type: optional_text(output, "File_Name_Type"),
                file_names: vec![required_text(output, "File_Name")?],
            });
        }
    }

    Ok(ProcessingTask {
        task_name: required_text(node, "Task_Name")?,
        task_version: required_text(node, "Task_Version")?,
        inputs,
        outputs,
    })
}
