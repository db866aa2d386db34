//! Host request interface.
//!
//! The host framework owns the request queue. For each request it hands the
//! dispatcher a control code and, on demand, the request's input and output
//! buffers; the dispatcher answers with exactly one [`Completion`].

use super::Command;
use crate::error::{DriverError, STATUS_SUCCESS};
use thiserror::Error;

/// Why a request's buffers were rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    /// The command needs input but none was supplied.
    #[error("{0} requires an input buffer")]
    MissingInput(Command),

    /// The command needs an output buffer but none was supplied.
    #[error("{0} requires an output buffer")]
    MissingOutput(Command),

    /// The input buffer has the wrong size.
    #[error("{command} expects {expected} input bytes, got {actual}")]
    InputSize {
        command: Command,
        expected: usize,
        actual: usize,
    },

    /// The output buffer has the wrong size.
    #[error("{command} expects {expected} output bytes, got {actual}")]
    OutputSize {
        command: Command,
        expected: usize,
        actual: usize,
    },

    /// The host framework could not supply a buffer.
    #[error("Failed to retrieve the {0} buffer")]
    Retrieval(&'static str),
}

/// Buffers attached to a request.
#[derive(Debug, Default)]
pub struct RequestBuffers<'a> {
    /// Input bytes, if the request carries any.
    pub input: Option<&'a [u8]>,
    /// Output space, if the request carries any.
    pub output: Option<&'a mut [u8]>,
}

/// A request delivered by the host framework.
pub trait HostRequest {
    /// The request's control code.
    fn control_code(&self) -> u32;

    /// Retrieve the request's buffers.
    fn buffers(&mut self) -> Result<RequestBuffers<'_>, BufferError>;

    /// Complete the request. Called exactly once per request.
    fn complete(&mut self, completion: Completion);
}

/// Outcome of one dispatched request.
#[derive(Debug)]
pub struct Completion {
    result: Result<(), DriverError>,
    bytes_written: usize,
}

impl Completion {
    /// A successful completion that wrote `bytes_written` output bytes.
    pub fn success(bytes_written: usize) -> Self {
        Self {
            result: Ok(()),
            bytes_written,
        }
    }

    /// A failed completion. Failed requests never report output.
    pub fn failed(error: DriverError) -> Self {
        Self {
            result: Err(error),
            bytes_written: 0,
        }
    }

    /// Status code for the host: [`STATUS_SUCCESS`] or a negative error code.
    pub fn status_code(&self) -> i32 {
        match &self.result {
            Ok(()) => STATUS_SUCCESS,
            Err(e) => e.status_code(),
        }
    }

    /// Number of output bytes written.
    pub fn bytes_written(&self) -> usize {
        self.bytes_written
    }

    /// Whether the request succeeded.
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// The error, if the request failed.
    pub fn error(&self) -> Option<&DriverError> {
        self.result.as_ref().err()
    }

    /// Convert into the bytes written or the error.
    pub fn into_result(self) -> Result<usize, DriverError> {
        self.result.map(|()| self.bytes_written)
    }
}

/// An in-memory request, as a user-space caller would submit it.
#[derive(Debug)]
pub struct IoRequest {
    code: u32,
    input: Vec<u8>,
    output: Vec<u8>,
    retrieval_fails: bool,
    completion: Option<Completion>,
}

impl IoRequest {
    /// A request with no buffers.
    pub fn new(code: u32) -> Self {
        Self {
            code,
            input: Vec::new(),
            output: Vec::new(),
            retrieval_fails: false,
            completion: None,
        }
    }

    /// Attach input bytes. An empty input counts as no input.
    pub fn with_input(mut self, input: &[u8]) -> Self {
        self.input = input.to_vec();
        self
    }

    /// Attach `len` bytes of output space. Zero counts as no output.
    pub fn with_output(mut self, len: usize) -> Self {
        self.output = vec![0; len];
        self
    }

    /// Make buffer retrieval fail, as when the host cannot map the buffers.
    pub fn with_retrieval_failure(mut self) -> Self {
        self.retrieval_fails = true;
        self
    }

    /// The completion, once the request has been handled.
    pub fn completion(&self) -> Option<&Completion> {
        self.completion.as_ref()
    }

    /// Take the completion out of the request.
    pub fn take_completion(&mut self) -> Option<Completion> {
        self.completion.take()
    }

    /// The output bytes reported as written.
    pub fn output(&self) -> &[u8] {
        let written = self.completion.as_ref().map_or(0, Completion::bytes_written);
        &self.output[..written.min(self.output.len())]
    }
}

impl HostRequest for IoRequest {
    fn control_code(&self) -> u32 {
        self.code
    }

    fn buffers(&mut self) -> Result<RequestBuffers<'_>, BufferError> {
        if self.retrieval_fails {
            return Err(BufferError::Retrieval("input"));
        }
        Ok(RequestBuffers {
            input: (!self.input.is_empty()).then_some(self.input.as_slice()),
            output: (!self.output.is_empty()).then_some(self.output.as_mut_slice()),
        })
    }

    fn complete(&mut self, completion: Completion) {
        debug_assert!(self.completion.is_none(), "request completed twice");
        self.completion = Some(completion);
    }
}
