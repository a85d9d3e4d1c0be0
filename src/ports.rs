//! Port specification parsing and free-port allocation.
//!
//! A fixture declares the ports it is willing to run on as a [`PortSpec`]:
//! an exact port, a range, a comma-separated combination of both, or the
//! wildcard `"?"` meaning any free ephemeral port. [`PortAllocator`] resolves
//! a spec to one concrete port, remembering every port it has handed out so
//! that concurrently declared fixtures never collide within one test run.
//!
//! The allocator is an explicit, session-scoped registry object rather than
//! process-global state; tests that need sharing hold it in a `LazyLock`.

use std::{
    collections::BTreeSet,
    net::TcpListener,
    str::FromStr,
    sync::Mutex,
};

/// Ports a fixture is willing to bind.
///
/// Parsed from strings like `"5432"`, `"2001-2004"`, `"2001,2004-2006"`, or
/// the wildcard `"?"`. An exact port (integer or all-digit string) is passed
/// through at resolution time without an availability probe, matching the
/// behavior of explicitly pinned fixtures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortSpec {
    /// Any free ephemeral port, chosen by the OS.
    Any,
    /// Exactly this port, no availability validation.
    Exact(u16),
    /// One free port out of this candidate set.
    Set(BTreeSet<u16>),
}

impl PortSpec {
    /// Returns the candidate set described by this spec, if it has one.
    ///
    /// `Any` has no candidate set; `Exact` is a singleton.
    pub fn candidates(&self) -> Option<BTreeSet<u16>> {
        match self {
            PortSpec::Any => None,
            PortSpec::Exact(port) => Some(BTreeSet::from([*port])),
            PortSpec::Set(set) => Some(set.clone()),
        }
    }
}

impl std::fmt::Display for PortSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortSpec::Any => f.write_str("?"),
            PortSpec::Exact(port) => write!(f, "{port}"),
            PortSpec::Set(set) => {
                let mut first = true;
                for port in set {
                    if !first {
                        f.write_str(",")?;
                    }
                    write!(f, "{port}")?;
                    first = false;
                }
                Ok(())
            }
        }
    }
}

impl From<u16> for PortSpec {
    fn from(port: u16) -> Self {
        PortSpec::Exact(port)
    }
}

impl FromStr for PortSpec {
    type Err = PortError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        if spec == "?" {
            return Ok(PortSpec::Any);
        }
        if !spec.is_empty() && spec.bytes().all(|b| b.is_ascii_digit()) {
            let port = spec.parse().map_err(|_| PortError::InvalidPortsDefinition {
                spec: spec.to_owned(),
            })?;
            return Ok(PortSpec::Exact(port));
        }

        let mut set = BTreeSet::new();
        for token in spec.split(',') {
            let range = parse_token(token).ok_or_else(|| PortError::InvalidPortsDefinition {
                spec: spec.to_owned(),
            })?;
            set.extend(range);
        }
        Ok(PortSpec::Set(set))
    }
}

/// Parses one spec token: either a single port or a `low-high` range with
/// `low <= high`. Returns `None` on any malformed token.
fn parse_token(token: &str) -> Option<std::ops::RangeInclusive<u16>> {
    if let Ok(port) = token.parse::<u16>() {
        return Some(port..=port);
    }
    let (low, high) = token.split_once('-')?;
    let low: u16 = low.parse().ok()?;
    let high: u16 = high.parse().ok()?;
    (low <= high).then_some(low..=high)
}

/// Session-scoped port registry.
///
/// `resolve()` calls are linearizable: the claimed-port set lives behind a
/// mutex held for the whole resolution, so two fixtures racing over the same
/// candidate range observe each other's claims and never receive the same
/// port. There is no cross-process coordination; parallel test-runner
/// processes contending for the same explicit range surface the race as a
/// startup error, not as two servers on one port.
#[derive(Debug, Default)]
pub struct PortAllocator {
    claimed: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    /// Creates an empty allocator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `spec` and resolves it to one concrete port.
    ///
    /// Convenience over [`PortSpec::from_str`] + [`resolve`](Self::resolve);
    /// malformed specs are rejected here, before any subprocess is spawned.
    pub fn resolve_spec(&self, spec: &str) -> Result<u16, PortError> {
        self.resolve(&spec.parse()?)
    }

    /// Resolves a [`PortSpec`] to one concrete port and claims it.
    ///
    /// - `Exact` is passed through unconditionally (pinned fixtures own
    ///   their port) but still recorded in the registry.
    /// - `Set` returns the first candidate that is neither claimed by an
    ///   earlier call nor bound by another live process.
    /// - `Any` asks the OS for a free ephemeral port.
    pub fn resolve(&self, spec: &PortSpec) -> Result<u16, PortError> {
        let mut claimed = self.claimed.lock().expect("port registry lock poisoned");

        let port = match spec {
            PortSpec::Exact(port) => *port,
            PortSpec::Set(candidates) => candidates
                .iter()
                .copied()
                .find(|port| !claimed.contains(port) && port_is_free(*port))
                .ok_or_else(|| PortError::NoFreePort {
                    spec: spec.to_string(),
                })?,
            PortSpec::Any => {
                // Bind port 0 and let the OS pick; retry the rare case where
                // the OS hands back a port we already claimed this session.
                let mut picked = None;
                for _ in 0..16 {
                    let port = bind_ephemeral()?;
                    if !claimed.contains(&port) {
                        picked = Some(port);
                        break;
                    }
                }
                picked.ok_or_else(|| PortError::NoFreePort {
                    spec: "?".to_owned(),
                })?
            }
        };

        claimed.insert(port);
        tracing::debug!(port = port, "claimed port");
        Ok(port)
    }
}

/// Checks whether `port` can currently be bound on the loopback interface.
fn port_is_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Binds `127.0.0.1:0` and returns the OS-assigned port.
fn bind_ephemeral() -> Result<u16, PortError> {
    let listener =
        TcpListener::bind("127.0.0.1:0").map_err(|err| PortError::ProbeFailed { source: err })?;
    let port = listener
        .local_addr()
        .map_err(|err| PortError::ProbeFailed { source: err })?
        .port();
    drop(listener);
    Ok(port)
}

/// Errors raised while parsing or resolving port specifications.
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    /// The port specification string is malformed.
    ///
    /// Raised during parsing, before any process is spawned. The message
    /// carries the offending input.
    #[error("invalid ports definition: '{spec}'")]
    InvalidPortsDefinition {
        /// The spec string as given by the caller.
        spec: String,
    },

    /// Every candidate port is claimed or bound by another process.
    #[error("no free port available for spec {spec}")]
    NoFreePort {
        /// The spec whose candidate set was exhausted.
        spec: String,
    },

    /// The OS refused the free-port probe itself.
    #[error("failed to probe for a free port")]
    ProbeFailed {
        /// The underlying socket error.
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ports(spec: &str) -> PortSpec {
        spec.parse().expect("spec should parse")
    }

    #[test]
    fn parses_wildcard() {
        assert_eq!(ports("?"), PortSpec::Any);
    }

    #[test]
    fn parses_exact_port() {
        assert_eq!(ports("2000"), PortSpec::Exact(2000));
    }

    #[test]
    fn parses_ranges_and_lists() {
        assert_eq!(
            ports("2001-2002"),
            PortSpec::Set(BTreeSet::from([2001, 2002]))
        );
        assert_eq!(
            ports("2001,2004,2005"),
            PortSpec::Set(BTreeSet::from([2001, 2004, 2005]))
        );
        assert_eq!(
            ports("2001-2003,2005,2009-2010"),
            PortSpec::Set(BTreeSet::from([2001, 2002, 2003, 2005, 2009, 2010]))
        );
    }

    #[test]
    fn overlapping_ranges_merge() {
        assert_eq!(
            ports("2001-2004,2002-2006"),
            PortSpec::Set(BTreeSet::from([2001, 2002, 2003, 2004, 2005, 2006]))
        );
    }

    #[test]
    fn malformed_specs_are_rejected_with_input_in_message() {
        for spec in ["21.32", "12--100", "12,30,400-300", "a,32,2"] {
            let err = spec.parse::<PortSpec>().expect_err("spec should be rejected");
            assert!(
                matches!(err, PortError::InvalidPortsDefinition { .. }),
                "unexpected error for {spec}: {err}"
            );
            assert!(
                err.to_string().contains(spec),
                "message should carry the offending input: {err}"
            );
        }
    }

    #[test]
    fn descending_range_is_rejected() {
        assert!(ports("2001-2004").candidates().is_some());
        assert!("400-300".parse::<PortSpec>().is_err());
    }

    #[test]
    fn exact_port_passes_through_without_probe() {
        let allocator = PortAllocator::new();
        // Port 1 is almost certainly not bindable, but Exact skips the probe.
        assert_eq!(
            allocator.resolve(&PortSpec::Exact(1)).expect("passthrough"),
            1
        );
    }

    #[test]
    fn resolved_port_is_member_of_candidate_set() {
        let allocator = PortAllocator::new();
        let spec = ports("28311-28318");
        let port = allocator.resolve(&spec).expect("a candidate should be free");
        assert!(spec.candidates().expect("set spec").contains(&port));
    }

    #[test]
    fn wildcard_resolves_to_a_bindable_port() {
        let allocator = PortAllocator::new();
        let port = allocator.resolve(&PortSpec::Any).expect("wildcard resolve");
        assert!(port > 0);
    }

    #[test]
    fn claimed_ports_are_not_handed_out_twice() {
        let allocator = PortAllocator::new();
        let spec = ports("28321-28322");

        let first = allocator.resolve(&spec).expect("first claim");
        let second = allocator.resolve(&spec).expect("second claim");
        assert_ne!(first, second, "claims over one range must be distinct");

        let err = allocator
            .resolve(&spec)
            .expect_err("two-port range exhausted by two claims");
        assert!(matches!(err, PortError::NoFreePort { .. }), "got: {err}");
    }

    #[test]
    fn exhaustion_error_is_distinct_from_malformed_spec() {
        let allocator = PortAllocator::new();
        allocator.resolve(&PortSpec::Exact(28331)).expect("claim");
        let err = allocator
            .resolve(&PortSpec::Set(BTreeSet::from([28331])))
            .expect_err("sole candidate already claimed");
        assert!(matches!(err, PortError::NoFreePort { .. }));
    }

    #[test]
    fn spec_display_round_trips() {
        assert_eq!(ports("?").to_string(), "?");
        assert_eq!(ports("2000").to_string(), "2000");
        assert_eq!(ports("2001-2003,2005").to_string(), "2001,2002,2003,2005");
    }
}
