//! Mapping from queue worker names to compute instance names.
//!
//! Workers register as `<instance-name>-<suffix>`, so the instance that hosts
//! a worker is found by dropping everything after the final separator. The
//! convention lives on the worker side, so it is configurable here rather
//! than fixed.

use crate::DEFAULT_NAME_SEPARATOR;

/// How a worker name is turned into the name of its instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameMapping {
    /// Drop the final separator and everything after it.
    StripSuffix { separator: char },

    /// Worker names are instance names.
    Verbatim,
}

impl Default for NameMapping {
    fn default() -> Self {
        Self::StripSuffix {
            separator: DEFAULT_NAME_SEPARATOR,
        }
    }
}

impl NameMapping {
    /// Instance name for a single worker.
    pub fn instance_name<'a>(&self, worker: &'a str) -> &'a str {
        match self {
            Self::StripSuffix { separator } => match worker.rfind(*separator) {
                Some(idx) => &worker[..idx],
                None => worker,
            },
            Self::Verbatim => worker,
        }
    }

    /// Instance names for a batch of workers, in the same order.
    pub fn instance_names<S: AsRef<str>>(&self, workers: &[S]) -> Vec<String> {
        workers
            .iter()
            .map(|w| self.instance_name(w.as_ref()).to_string())
            .collect()
    }
}
