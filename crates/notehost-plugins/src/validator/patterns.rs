//! Suspicious call pattern scanning
//!
//! Entries are read in chunks, so the scanner keeps the tail of the previous
//! chunk to catch patterns that straddle a chunk boundary.

use std::collections::BTreeSet;

use super::Severity;

/// A marker is reported when every one of its needles occurs somewhere in
/// the entry. Compiled class files keep class and member names as separate
/// constant-pool strings, so their markers pair a slash-form class name with
/// a member name.
pub(crate) struct Pattern {
    pub label: &'static str,
    pub needles: &'static [&'static str],
    pub severity: Severity,
}

macro_rules! pattern {
    ($label:literal, [$($needle:literal),+], $severity:ident) => {
        Pattern {
            label: $label,
            needles: &[$($needle),+],
            severity: Severity::$severity,
        }
    };
    ($needle:literal, $severity:ident) => {
        pattern!($needle, [$needle], $severity)
    };
}

pub(crate) const PATTERNS: [Pattern; 17] = [
    pattern!("Runtime.getRuntime().exec", Failure),
    pattern!("java/lang/Runtime.exec", ["java/lang/Runtime", "exec"], Failure),
    pattern!("ProcessBuilder", Failure),
    pattern!("sun.misc.Unsafe", Failure),
    pattern!("sun/misc/Unsafe", Failure),
    pattern!("setAccessible", Failure),
    pattern!("child_process", Failure),
    pattern!("loadLibrary", Failure),
    pattern!("eval(", Warning),
    pattern!("new Function(", Warning),
    pattern!("Class.forName", Warning),
    pattern!("java/lang/Class.forName", ["java/lang/Class", "forName"], Warning),
    pattern!("ClassLoader", Warning),
    pattern!("java/lang/reflect", Warning),
    pattern!("document.cookie", Warning),
    pattern!("XMLHttpRequest", Warning),
    pattern!("WebAssembly.instantiate", Warning),
];

fn longest_needle() -> usize {
    PATTERNS
        .iter()
        .flat_map(|p| p.needles.iter())
        .map(|needle| needle.len())
        .max()
        .unwrap_or(0)
}

#[derive(Default)]
pub(crate) struct ContentScanner {
    carry: Vec<u8>,
    // (pattern index, needle index)
    seen: BTreeSet<(usize, usize)>,
}

impl ContentScanner {
    pub fn feed(&mut self, chunk: &[u8]) {
        let mut window = std::mem::take(&mut self.carry);
        window.extend_from_slice(chunk);

        for (index, pattern) in PATTERNS.iter().enumerate() {
            for (needle_index, needle) in pattern.needles.iter().enumerate() {
                if self.seen.contains(&(index, needle_index)) {
                    continue;
                }
                if window.windows(needle.len()).any(|w| w == needle.as_bytes()) {
                    self.seen.insert((index, needle_index));
                }
            }
        }

        let keep = longest_needle().saturating_sub(1).min(window.len());
        self.carry = window.split_off(window.len() - keep);
    }

    /// Patterns seen in this entry, each reported once
    pub fn finish(self) -> Vec<&'static Pattern> {
        PATTERNS
            .iter()
            .enumerate()
            .filter(|(index, pattern)| {
                (0..pattern.needles.len()).all(|n| self.seen.contains(&(*index, n)))
            })
            .map(|(_, pattern)| pattern)
            .collect()
    }
}
