// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

pub mod archive;
pub mod demangle;
pub mod describe;
pub mod diag;
pub mod diff;
pub mod extract;
pub mod funcsig;
pub mod models;
pub mod objfile;
pub mod quality;
pub mod resolve;
pub mod sizefile;
pub mod srcmap;
pub mod toolchain;

/// Type-erased error type.
///
/// We primarily use this to hand out errors from third-party libraries where
/// lifting them into distinct error variants didn't make sense because no
/// consumer cares about differentiating between different error variants.
pub type AnyError = Box<dyn std::error::Error + Send + Sync>;

/// Virtual address in the ELF / mach-O address space.
pub type VirtAddr = u64;

/// Coarse classification of fatal errors.
///
/// Every module error can be mapped into one of these. Front-ends use this
/// to decide on exit codes without having to know about every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A required external tool is absent.
    ToolchainMissing,
    /// An input file is missing, unreadable or corrupt.
    MalformedInput,
    /// Extraction produced data that violates an internal invariant.
    InvariantViolation,
    /// Any other IO failure (e.g. writing the output).
    Io,
}
