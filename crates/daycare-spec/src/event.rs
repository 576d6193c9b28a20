//! Execution events streamed from a container and recorded in transcripts.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::b64;

/// One observable moment in a running container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    pub time: DateTime<Utc>,
    #[serde(flatten)]
    pub event: Event,
}

/// Event payloads, tagged on the wire by the `event` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum Event {
    Exec {
        #[serde(rename = "execcommand")]
        command: Vec<String>,
    },
    Stdin {
        #[serde(rename = "streamdata", with = "b64::bytes")]
        data: Vec<u8>,
    },
    Stdout {
        #[serde(rename = "streamdata", with = "b64::bytes")]
        data: Vec<u8>,
    },
    Stderr {
        #[serde(rename = "streamdata", with = "b64::bytes")]
        data: Vec<u8>,
    },
    Exit {
        #[serde(rename = "exitstatus")]
        status: i32,
    },
    Error {
        error: String,
    },
    Files {
        #[serde(with = "b64::files")]
        files: BTreeMap<String, Vec<u8>>,
    },
}

impl EventMessage {
    /// Stamp an event with the current time.
    pub fn now(event: Event) -> Self {
        Self {
            time: Utc::now(),
            event,
        }
    }

    /// Stream payload size in bytes; zero for non-stream events.
    pub fn stream_len(&self) -> usize {
        self.event.stream_data().map_or(0, <[u8]>::len)
    }

    /// Merge `next` into `self` if both are the same stream.
    ///
    /// On success the payloads are concatenated and the timestamp advances to
    /// `next.time`. Returns `next` back unchanged when the events differ.
    pub fn merge(&mut self, next: EventMessage) -> Result<(), EventMessage> {
        let appended = match (&mut self.event, &next.event) {
            (Event::Stdin { data }, Event::Stdin { data: more })
            | (Event::Stdout { data }, Event::Stdout { data: more })
            | (Event::Stderr { data }, Event::Stderr { data: more }) => {
                data.extend_from_slice(more);
                true
            }
            _ => false,
        };
        if appended {
            self.time = next.time;
            Ok(())
        } else {
            Err(next)
        }
    }

    /// Single-line canonical rendering used in commit signatures and logs.
    pub fn describe(&self) -> String {
        match &self.event {
            Event::Exec { command } => format!("event: exec {}", command.join(" ")),
            Event::Exit { status } => format!("event: exit {status}"),
            Event::Stdin { data } | Event::Stdout { data } | Event::Stderr { data } => {
                format!("event: {} \"{}\"", self.event.name(), data.escape_ascii())
            }
            Event::Error { error } => format!("event: error {error}"),
            Event::Files { files } => {
                let names: Vec<&str> = files.keys().map(String::as_str).collect();
                format!("event: files {}", names.join(", "))
            }
        }
    }
}

impl Event {
    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Event::Exec { .. } => "exec",
            Event::Stdin { .. } => "stdin",
            Event::Stdout { .. } => "stdout",
            Event::Stderr { .. } => "stderr",
            Event::Exit { .. } => "exit",
            Event::Error { .. } => "error",
            Event::Files { .. } => "files",
        }
    }

    /// Payload of a stream event.
    pub fn stream_data(&self) -> Option<&[u8]> {
        match self {
            Event::Stdin { data } | Event::Stdout { data } | Event::Stderr { data } => Some(data),
            _ => None,
        }
    }

    pub fn is_stream(&self) -> bool {
        self.stream_data().is_some()
    }
}
