//! Default topic names for connections configured without one.
//!
//! | Segment        | Source                                     |
//! |----------------|--------------------------------------------|
//! | `hostname`     | `hostname` crate, or configuration         |
//! | `owner`        | component owning the port (omitted if none) |
//! | `port`         | port name                                  |
//! | `instance_tag` | [`ElementId`] of the publisher             |
//! | `pid`          | `std::process::id()`                       |
//!
//! The name is a pure function of these inputs: the same inputs always give
//! the same topic, and two processes never collide.

use std::fmt::Display;

use flowbridge_types::{ElementId, PortInfo};

const FALLBACK_HOSTNAME: &str = "localhost";

/// Build `hostname/owner/port/instance_tag/pid`.
///
/// The owner segment is left out when `owner` is `None` or empty.  Characters
/// that are not valid inside a topic segment (including `/`) are replaced by
/// `_`.
pub fn default_topic_name(
    hostname: &str,
    owner: Option<&str>,
    port: &str,
    instance_tag: impl Display,
    pid: u32,
) -> String {
    let mut segments = vec![sanitize(hostname)];
    if let Some(owner) = owner.filter(|o| !o.is_empty()) {
        segments.push(sanitize(owner));
    }
    segments.push(sanitize(port));
    segments.push(sanitize(&instance_tag.to_string()));
    segments.push(pid.to_string());
    segments.join("/")
}

fn sanitize(segment: &str) -> String {
    if segment.is_empty() {
        return "_".to_string();
    }
    segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Host and process identity used to fill in default topic names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicNamer {
    hostname: String,
    pid: u32,
}

impl TopicNamer {
    pub fn new(hostname: impl Into<String>, pid: u32) -> Self {
        Self {
            hostname: hostname.into(),
            pid,
        }
    }

    /// Identity of the running process.
    pub fn from_system() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| FALLBACK_HOSTNAME.to_string());
        Self::new(hostname, std::process::id())
    }

    /// Same process, different host name.
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Default topic for the publisher `id` of `port`.
    pub fn name_for(&self, port: &PortInfo, id: ElementId) -> String {
        default_topic_name(&self.hostname, port.owner.as_deref(), &port.name, id, self.pid)
    }
}

impl Default for TopicNamer {
    fn default() -> Self {
        Self::from_system()
    }
}
