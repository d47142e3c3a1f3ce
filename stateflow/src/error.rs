// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT
use std::fmt::Display;

/// Execution result.
pub type Result<T> = std::result::Result<T, ExecutionError>;

/// Errors raised while advancing an event flow graph or invoking user code.
///
/// Recoverable errors (missing inputs, user-code failures) are translated by
/// the operator into `FailedInvocation` replies; the flow in question is
/// abandoned but other in-flight flows are unaffected. Fatal errors indicate
/// a broken runtime invariant and propagate to the host.
#[derive(thiserror::Error, Debug)]
pub enum ExecutionError {
    #[error("cannot resolve inputs for {fun_name}: missing {missing:?}")]
    MissingInput {
        fun_name: String,
        missing: Vec<String>,
    },
    #[error("invocation failed: {0}")]
    Invocation(String),
    #[error("fatal error: {0:?}")]
    Fatal(#[from] anyhow::Error),
}

impl ExecutionError {
    /// True for errors that become `FailedInvocation` replies rather than
    /// unwinding the operator.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ExecutionError::Fatal(_))
    }
}

/// Classifies a raw result as fatal, in the manner of the kernel-side
/// classification the rest of this codebase uses.
pub trait ClassifyResult: Sized {
    type Value;
    fn or_fatal(self) -> Result<Self::Value>;
}

impl<T, E> ClassifyResult for std::result::Result<T, E>
where
    E: Into<anyhow::Error>,
{
    type Value = T;

    fn or_fatal(self) -> Result<T> {
        self.map_err(|e| ExecutionError::Fatal(e.into()))
    }
}

/// Context attachment that preserves the error classification.
pub trait Context {
    type WithContext;
    fn context<D: Display>(self, context: D) -> Self::WithContext;
}

impl<T> Context for Result<T> {
    type WithContext = Result<T>;

    fn context<D: Display>(self, context: D) -> Result<T> {
        self.map_err(|e| match e {
            ExecutionError::Fatal(err) => ExecutionError::Fatal(err.context(context.to_string())),
            other => other,
        })
    }
}
