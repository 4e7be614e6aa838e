// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Response processors.
//!
//! A processor transforms a [`Response`] in place and may fail; processors
//! compose as an ordered pipeline where the first failure short-circuits
//! and is reported for the resource.

pub mod html;
pub mod htmlscan;
pub mod preverify;

use crate::error::ProcessError;
use crate::resource::Response;

pub use html::{HtmlProcessor, HtmlTask, TaskSetConfig};
pub use preverify::{HttpStatusCode, MaxContentLength, RequireHeaders, ScrubHeaders};

/// A single stage of the processing pipeline.
pub trait Processor: Send + Sync {
    fn process(&self, resp: &mut Response) -> Result<(), ProcessError>;
}

/// Runs each processor in order; stops at the first failure.
pub struct ProcessorSequence(pub Vec<Box<dyn Processor>>);

impl Processor for ProcessorSequence {
    fn process(&self, resp: &mut Response) -> Result<(), ProcessError> {
        for processor in &self.0 {
            processor.process(resp)?;
        }
        Ok(())
    }
}

/// Assemble the standard pipeline: preverification, header scrubbing, then
/// HTML processing for HTML responses.
pub fn comprehensive(
    allowed_status: Vec<u16>,
    size_limit: Option<usize>,
    task_set: TaskSetConfig,
) -> ProcessorSequence {
    ProcessorSequence(vec![
        Box::new(HttpStatusCode::new(allowed_status)),
        Box::new(MaxContentLength::new(size_limit)),
        Box::new(RequireHeaders::new(vec!["Content-Type".to_string()])),
        Box::new(ScrubHeaders::default()),
        Box::new(HtmlProcessor::new(task_set.build())),
    ])
}
