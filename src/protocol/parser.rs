//! Protocol v2 upload-pack request classification.
//!
//! Grammar per <https://www.git-scm.com/docs/protocol-v2#_command_request>:
//! a capability section terminated by a delimiter (or flush for commands
//! without arguments), then argument lines up to the terminating flush.
//! Some clients send the `command=` line in the middle of the capability
//! section, so command and capabilities are parsed together.
//!
//! A `fetch` command additionally yields a deterministic fingerprint: the
//! SHA-256 of its canonical form (sorted wants, sorted haves, sorted
//! argument lines, LF-separated).  Two requests with equal fingerprints are
//! satisfied by the same pack.

use std::collections::{BTreeMap, BTreeSet};

use sha2::{Digest, Sha256};
use tracing::warn;

use super::pktline::{decode_pkt_lines, PktLine, ProtocolError};

// ---------------------------------------------------------------------------
// Known capability and argument tables
// ---------------------------------------------------------------------------

/// Capabilities that may precede the delimiter (excluding `command`).
const GIT_CAPS: &[&str] = &["agent", "server-option", "object-format", "session-id"];

/// Arguments a `fetch` command may carry.
const FETCH_ARGS: &[&str] = &[
    "want",
    "have",
    "done",
    "thin-pack",
    "no-progress",
    "include-tag",
    "ofs-delta",
    "shallow",
    "deepen",
    "deepen-relative",
    "deepen-since",
    "deepen-not",
    "filter",
    "want-ref",
    "sideband-all",
    "packfile-uris",
    "wait-for-done",
];

// ---------------------------------------------------------------------------
// Classification result
// ---------------------------------------------------------------------------

/// The classified command of an upload-pack request body.
///
/// Only `fetch` is intercepted; everything else is proxied to the upstream
/// with its raw body untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    LsRefs {
        caps: BTreeMap<String, String>,
    },
    Fetch(FetchCommand),
    /// `object-info`, an empty request, or a command this proxy does not
    /// know.  `command` is `None` for an empty request.
    Unknown {
        command: Option<String>,
    },
}

/// Parsed argument set of a `fetch` command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchCommand {
    pub caps: BTreeMap<String, String>,
    pub wants: BTreeSet<String>,
    pub haves: BTreeSet<String>,
    /// Arguments other than wants, haves and the shallow set.  Value-less
    /// arguments (`done`, `thin-pack`, ...) map to `None`.
    pub args: BTreeMap<String, Option<String>>,
    /// `shallow`/`deepen*` lines, kept verbatim.
    pub shallow_lines: BTreeSet<String>,
    pub done: bool,
}

impl FetchCommand {
    /// An initial clone negotiates with no `have` lines.
    pub fn is_clone(&self) -> bool {
        self.haves.is_empty()
    }

    pub fn has_filter(&self) -> bool {
        self.args.contains_key("filter")
    }

    /// Fingerprint identifying the pack this command produces.
    ///
    /// SHA-256 (lowercase hex) over the canonical form: sorted `want`
    /// lines, sorted `have` lines, then the sorted set of remaining
    /// argument lines (including the shallow set), joined with LF.  Line
    /// order and duplicates in the wire form do not affect the result.
    pub fn fingerprint(&self) -> String {
        let mut canonical = String::new();
        for want in &self.wants {
            canonical.push_str("want ");
            canonical.push_str(want);
            canonical.push('\n');
        }
        for have in &self.haves {
            canonical.push_str("have ");
            canonical.push_str(have);
            canonical.push('\n');
        }
        let mut options: BTreeSet<String> = self.shallow_lines.clone();
        for (key, value) in &self.args {
            options.insert(match value {
                Some(value) => format!("{key} {value}"),
                None => key.clone(),
            });
        }
        for option in &options {
            canonical.push_str(option);
            canonical.push('\n');
        }

        let digest = Sha256::digest(canonical.as_bytes());
        hex::encode(digest)
    }

    /// Compact description for request logs.
    pub fn summary(&self) -> String {
        format!(
            "wants={} haves={} clone={} done={} filter={} shallow={}",
            self.wants.len(),
            self.haves.len(),
            self.is_clone(),
            self.done,
            self.has_filter(),
            !self.shallow_lines.is_empty(),
        )
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Classify an upload-pack request body.
///
/// Framing errors and grammar violations return [`ProtocolError`]; an
/// unknown command is not an error (it is forwarded as-is).
pub fn classify(body: &[u8]) -> Result<Command, ProtocolError> {
    let mut packets = decode_pkt_lines(body)?.into_iter();

    // ---- capability section (command may appear anywhere in it) ----
    let mut command: Option<String> = None;
    let mut caps = BTreeMap::new();
    let mut saw_delim = false;

    for pkt in packets.by_ref() {
        match pkt {
            PktLine::Flush => break,
            PktLine::Delimiter => {
                saw_delim = true;
                break;
            }
            PktLine::ResponseEnd => {
                return Err(ProtocolError::new(
                    "response-end packet in capability section",
                ));
            }
            PktLine::Data(data) => {
                let line = data_line(&data)?;
                let (key, value) = match line.split_once('=') {
                    Some((k, v)) => (k.to_string(), v.to_string()),
                    None => (line.clone(), String::new()),
                };
                if key == "command" {
                    if let Some(previous) = &command {
                        return Err(ProtocolError::new(format!(
                            "two commands in one request ({previous} and {value})"
                        )));
                    }
                    command = Some(value);
                } else {
                    if !GIT_CAPS.contains(&key.as_str()) {
                        warn!(cap = %key, "unknown capability");
                    }
                    caps.insert(key, value);
                }
            }
        }
    }

    let command = match command {
        Some(command) => command,
        // An empty request (lone flush) carries no command.
        None if caps.is_empty() => return Ok(Command::Unknown { command: None }),
        None => return Err(ProtocolError::new("missing command keyword")),
    };

    match command.as_str() {
        "ls-refs" => Ok(Command::LsRefs { caps }),
        "fetch" => {
            let fetch = parse_fetch_args(caps, &mut packets, saw_delim)?;
            if packets.next().is_some() {
                return Err(ProtocolError::new("data after terminating flush packet"));
            }
            Ok(Command::Fetch(fetch))
        }
        other => {
            // Assume new commands exist; the upstream knows them even if we
            // do not.
            warn!(command = %other, "unknown upload-pack command, proxying");
            Ok(Command::Unknown {
                command: Some(other.to_string()),
            })
        }
    }
}

fn parse_fetch_args(
    caps: BTreeMap<String, String>,
    packets: &mut impl Iterator<Item = PktLine>,
    saw_delim: bool,
) -> Result<FetchCommand, ProtocolError> {
    let mut fetch = FetchCommand {
        caps,
        ..FetchCommand::default()
    };

    if !saw_delim {
        // Argument-less fetch: the capability section ended with the flush.
        return Ok(fetch);
    }

    let mut terminated = false;
    for pkt in packets {
        match pkt {
            PktLine::Flush => {
                terminated = true;
                break;
            }
            PktLine::Delimiter | PktLine::ResponseEnd => {
                return Err(ProtocolError::new("section packet in argument list"));
            }
            PktLine::Data(data) => {
                let line = data_line(&data)?;
                let (key, value) = match line.split_once(' ') {
                    Some((k, v)) => (k, Some(v)),
                    None => (line.as_str(), None),
                };
                if !FETCH_ARGS.contains(&key) {
                    warn!(arg = %key, "unknown fetch argument, not fingerprinted");
                    continue;
                }
                match (key, value) {
                    ("want", Some(oid)) => {
                        fetch.wants.insert(oid.to_string());
                    }
                    ("have", Some(oid)) => {
                        fetch.haves.insert(oid.to_string());
                    }
                    ("shallow", Some(_)) | ("deepen", Some(_)) | ("deepen-since", Some(_))
                    | ("deepen-not", Some(_)) | ("deepen-relative", None) => {
                        fetch.shallow_lines.insert(line.clone());
                    }
                    ("done", None) => {
                        fetch.done = true;
                        fetch.args.insert("done".to_string(), None);
                    }
                    (key, value) => {
                        fetch
                            .args
                            .insert(key.to_string(), value.map(str::to_string));
                    }
                }
            }
        }
    }

    if !terminated {
        return Err(ProtocolError::new("missing terminating flush packet"));
    }
    Ok(fetch)
}

/// Decode one data packet into a normalized text line: UTF-8, trailing
/// newline stripped, lowercased (oids and argument keywords are defined in
/// lowercase; mixed case comes from misbehaving clients).
fn data_line(data: &[u8]) -> Result<String, ProtocolError> {
    let line = std::str::from_utf8(data)
        .map_err(|_| ProtocolError::new("non-UTF-8 command line"))?
        .trim_end_matches('\n');
    Ok(line.to_ascii_lowercase())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
