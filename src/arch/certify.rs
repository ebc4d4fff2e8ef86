//! Compatibility verdicts between a stored descriptor and the running build

use super::probe::{ArchProbe, ImageProbe};
use super::ArchDescriptor;
use crate::error::Result;
use std::fmt;
use tracing::warn;

/// A descriptor field that failed certification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mismatch {
    /// Stored reserved bytes are non-zero or differ from the current ones
    Reserved,
    Machine,
    ByteOrder,
    WordClass,
    LayoutDescriptor,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Mismatch::Reserved => "reserved",
            Mismatch::Machine => "machine",
            Mismatch::ByteOrder => "byte order",
            Mismatch::WordClass => "word class",
            Mismatch::LayoutDescriptor => "layout descriptor",
        };
        f.write_str(name)
    }
}

/// Decides whether a pool written by one build may be opened by another
///
/// Every field must match exactly. Non-zero reserved bytes in the stored
/// descriptor mean an extension this build does not understand and always
/// fail certification.
#[derive(Debug, Clone, Default)]
pub struct ArchCertifier<P = ImageProbe> {
    probe: P,
}

impl ArchCertifier<ImageProbe> {
    /// Certifier that probes the running image
    pub fn new() -> Self {
        ArchCertifier { probe: ImageProbe }
    }

    /// Fields of `stored` that are incompatible with `current`
    pub fn mismatches(current: &ArchDescriptor, stored: &ArchDescriptor) -> Vec<Mismatch> {
        let mut failed = Vec::new();

        if !stored.reserved_is_zero() || stored.reserved() != current.reserved() {
            failed.push(Mismatch::Reserved);
        }
        if stored.machine().as_u16() != current.machine().as_u16() {
            failed.push(Mismatch::Machine);
        }
        if stored.byte_order() != current.byte_order() {
            failed.push(Mismatch::ByteOrder);
        }
        if stored.word_class() != current.word_class() {
            failed.push(Mismatch::WordClass);
        }
        if stored.layout_descriptor() != current.layout_descriptor() {
            failed.push(Mismatch::LayoutDescriptor);
        }

        failed
    }

    /// Pure compatibility verdict
    pub fn check(current: &ArchDescriptor, stored: &ArchDescriptor) -> bool {
        Self::mismatches(current, stored).is_empty()
    }
}

impl<P: ArchProbe> ArchCertifier<P> {
    /// Certifier using a custom probe for the current environment
    pub fn with_probe(probe: P) -> Self {
        ArchCertifier { probe }
    }

    /// Probe the current environment and certify `stored` against it
    ///
    /// Probe failures propagate; mismatches are logged and yield `false`.
    pub fn certify(&self, stored: &ArchDescriptor) -> Result<bool> {
        let current = self.probe.probe()?;
        let failed = ArchCertifier::mismatches(&current, stored);

        for field in &failed {
            warn!(
                field = %field,
                stored = ?stored,
                current = ?current,
                "architecture descriptor mismatch"
            );
        }

        Ok(failed.is_empty())
    }
}
