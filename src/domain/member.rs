use crate::library::helpers::hostname;
use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of one consuming process within a cohort
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(String);

impl MemberId {
    /// Wraps an existing identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates an identifier of the form `<hostname>-<pid>-<random suffix>`
    pub fn generate() -> Self {
        Self::from_parts(&hostname(), std::process::id(), thread_rng().gen::<u32>())
    }

    fn from_parts(host: &str, pid: u32, suffix: u32) -> Self {
        // Slashes would create additional levels in the coordination store
        let host = host.replace('/', "_");
        Self(format!("{}-{}-{:08x}", host, pid, suffix))
    }

    /// Raw representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MemberId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// This process as a member of the cohort
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Member {
    /// Identifier used for elections and assignments
    pub id: MemberId,
    /// Machine the process runs on
    pub host: String,
    /// Operating system process identifier
    pub pid: u32,
}

impl Member {
    /// Describes the current process, optionally with a fixed identifier
    pub fn current(id: Option<MemberId>) -> Self {
        Self {
            id: id.unwrap_or_else(MemberId::generate),
            host: hostname(),
            pid: std::process::id(),
        }
    }
}

#[cfg(test)]
mod does {
    use super::*;

    #[test]
    fn combine_host_pid_and_suffix() {
        assert_eq!(
            MemberId::from_parts("worker-1", 42, 0xbeef).as_str(),
            "worker-1-42-0000beef"
        );
    }

    #[test]
    fn stay_within_a_single_path_segment() {
        assert!(!MemberId::from_parts("a/b", 1, 1).as_str().contains('/'));
    }

    #[test]
    fn generate_distinct_ids() {
        assert_ne!(MemberId::generate(), MemberId::generate());
    }
}
