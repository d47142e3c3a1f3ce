// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Execution-plan compiler and runtime interpreter for distributed stateful
//! dataflows.
//!
//! A user program, described through the abstract model in [`program`] as
//! classes with fields and methods, is turned into a set of [`descriptors`],
//! split into per-method block graphs by [`split`], and lowered into portable
//! [event flow graphs](dataflow::EventFlowGraph). At runtime a
//! [`StatefulOperator`](operator::StatefulOperator) dispatches request events
//! against per-key state and advances in-flight flow graphs one node at a
//! time, externalizing every cross-key transition as an event on the
//! messaging substrate.
//!
//! ## Logging
//!
//! This package emits logs using the log façade. Configure the logging backend
//! of your choice during the initialization of the consuming application.

pub mod analysis;
pub mod dataflow;
pub mod descriptors;
pub mod error;
pub mod operator;
pub mod program;
pub mod split;
pub mod wrapper;

pub use descriptors::Dataflow;
pub use error::{ExecutionError, Result};
pub use operator::StatefulOperator;
pub use wrapper::{ClassWrapper, InvocationResult};

/// Compiles a set of user classes into a ready-to-run [`Dataflow`]: extracts
/// descriptors, links them, splits every linked method, and lowers the block
/// graphs into event flow graphs.
pub fn build_dataflow(
    classes: &[program::ClassDef],
) -> std::result::Result<Dataflow, analysis::ExtractionError> {
    let mut descriptors = Vec::with_capacity(classes.len());
    for class in classes {
        descriptors.push(analysis::extract_class(class)?);
    }
    analysis::link_classes(&mut descriptors);

    let mut dataflow = Dataflow::new(descriptors);
    split::split_methods(&mut dataflow);
    dataflow::compile::compile_flows(&mut dataflow);
    Ok(dataflow)
}
