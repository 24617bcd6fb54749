//! Remote endpoints and blacklist-based failover.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Port used when a destination is given without one.
pub const DEFAULT_PORT: u16 = 4242;

/// A `host:port` string could not be parsed.
#[derive(Debug, Error, PartialEq)]
#[error("invalid destination '{0}': expected host[:port]")]
pub struct DestinationParseError(pub String);

/// One remote time-series endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Destination {
    pub host: String,
    pub port: u16,
}

impl Destination {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Destination {
    type Err = DestinationParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let err = || DestinationParseError(s.to_string());

        // Bracketed IPv6: [::1]:4242 or [::1]
        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(err)?;
            let port = match tail.strip_prefix(':') {
                Some(p) => p.parse().map_err(|_| err())?,
                None if tail.is_empty() => DEFAULT_PORT,
                None => return Err(err()),
            };
            if host.is_empty() {
                return Err(err());
            }
            return Ok(Self::new(host, port));
        }

        let (host, port) = match s.rsplit_once(':') {
            Some((host, port)) => (host, port.parse().map_err(|_| err())?),
            None => (s, DEFAULT_PORT),
        };
        if host.is_empty() || host.contains(':') || host.chars().any(char::is_whitespace) {
            return Err(err());
        }
        Ok(Self::new(host, port))
    }
}

impl TryFrom<String> for Destination {
    type Error = DestinationParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Destination> for String {
    fn from(value: Destination) -> Self {
        value.to_string()
    }
}

// =============================================================================
// Pool
// =============================================================================

/// Ordered destination pool with a blacklist and a current pointer.
///
/// Owned and mutated by the sender only.
#[derive(Debug)]
pub struct DestinationPool {
    pool: Vec<Destination>,
    blacklist: HashSet<Destination>,
    /// Index of the last pick; scanning resumes after it.
    cursor: Option<usize>,
    /// Last pick, cleared when it is blacklisted.
    current: Option<usize>,
    rng: StdRng,
}

impl DestinationPool {
    /// Create a pool shuffled with an entropy-seeded generator.
    ///
    /// # Panics
    /// Panics if `destinations` is empty.
    pub fn new(destinations: Vec<Destination>) -> Self {
        Self::with_rng(destinations, StdRng::from_entropy())
    }

    /// Create a pool with an explicit generator (deterministic in tests).
    ///
    /// # Panics
    /// Panics if `destinations` is empty.
    pub fn with_rng(mut destinations: Vec<Destination>, mut rng: StdRng) -> Self {
        assert!(!destinations.is_empty(), "destination pool cannot be empty");
        let mut seen = HashSet::new();
        destinations.retain(|d| seen.insert(d.clone()));
        destinations.shuffle(&mut rng);
        Self {
            pool: destinations,
            blacklist: HashSet::new(),
            cursor: None,
            current: None,
            rng,
        }
    }

    /// Select the next eligible destination.
    ///
    /// Scans forward from just after the previous pick, wrapping around.
    /// If every destination is blacklisted the blacklist is cleared, the pool
    /// reshuffled and index 0 selected.
    pub fn pick(&mut self) -> &Destination {
        let len = self.pool.len();
        let start = self.cursor.map_or(0, |i| (i + 1) % len);

        let found = (0..len)
            .map(|offset| (start + offset) % len)
            .find(|&i| !self.blacklist.contains(&self.pool[i]));

        let index = match found {
            Some(i) => i,
            None => {
                tracing::info!(
                    destinations = len,
                    "All destinations blacklisted, clearing blacklist"
                );
                self.blacklist.clear();
                self.pool.shuffle(&mut self.rng);
                0
            }
        };

        self.cursor = Some(index);
        self.current = Some(index);
        &self.pool[index]
    }

    /// Mark a destination ineligible until the next exhaustion clear.
    ///
    /// Blacklisting the current destination clears it; [`current`] returns
    /// `None` until the next [`pick`].
    ///
    /// [`current`]: Self::current
    /// [`pick`]: Self::pick
    pub fn blacklist(&mut self, dest: &Destination) {
        if self.current().is_some_and(|c| c == dest) {
            self.current = None;
        }
        if self.blacklist.insert(dest.clone()) {
            tracing::warn!(
                destination = %dest,
                blacklisted = self.blacklist.len(),
                total = self.pool.len(),
                "Destination blacklisted"
            );
        }
    }

    /// Most recently picked destination, unless it has since been blacklisted.
    pub fn current(&self) -> Option<&Destination> {
        self.current.map(|i| &self.pool[i])
    }

    pub fn is_blacklisted(&self, dest: &Destination) -> bool {
        self.blacklist.contains(dest)
    }

    pub fn blacklisted_count(&self) -> usize {
        self.blacklist.len()
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dests(n: u16) -> Vec<Destination> {
        (0..n).map(|i| Destination::new("tsdb", 4000 + i)).collect()
    }

    fn pool(n: u16) -> DestinationPool {
        DestinationPool::with_rng(dests(n), StdRng::seed_from_u64(7))
    }

    #[test]
    fn test_parse_destination() {
        assert_eq!(
            "tsdb.local:4243".parse::<Destination>().unwrap(),
            Destination::new("tsdb.local", 4243)
        );
        assert_eq!(
            "tsdb.local".parse::<Destination>().unwrap(),
            Destination::new("tsdb.local", DEFAULT_PORT)
        );
        assert_eq!(
            "[::1]:9000".parse::<Destination>().unwrap(),
            Destination::new("::1", 9000)
        );
        assert!("tsdb:notaport".parse::<Destination>().is_err());
        assert!(":4242".parse::<Destination>().is_err());
        assert!("::1:4242".parse::<Destination>().is_err());
    }

    #[test]
    fn test_display_roundtrip() {
        for d in [Destination::new("a.b", 1), Destination::new("::1", 2)] {
            assert_eq!(d.to_string().parse::<Destination>().unwrap(), d);
        }
    }

    #[test]
    fn test_pick_rotates_without_failures() {
        let mut p = pool(3);
        let first = p.pick().clone();
        let second = p.pick().clone();
        let third = p.pick().clone();
        let fourth = p.pick().clone();
        assert_ne!(first, second);
        assert_ne!(second, third);
        assert_eq!(first, fourth);
    }

    #[test]
    fn test_failover_tries_every_destination_before_repeat() {
        for n in 1..=6 {
            let mut p = pool(n);
            let mut seen = HashSet::new();

            for _ in 0..n {
                let d = p.pick().clone();
                assert!(!p.is_blacklisted(&d), "picked a blacklisted destination");
                assert!(seen.insert(d.clone()), "destination repeated before all tried");
                p.blacklist(&d);
            }
            assert_eq!(seen.len(), n as usize);
            assert_eq!(p.blacklisted_count(), n as usize);

            // The next pick clears the blacklist.
            let d = p.pick().clone();
            assert_eq!(p.blacklisted_count(), 0);
            assert_eq!(p.current(), Some(&d));
        }
    }

    #[test]
    fn test_pick_skips_blacklisted() {
        let mut p = pool(4);
        let a = p.pick().clone();
        let b = p.pick().clone();
        p.blacklist(&b);
        // Wrap around past `b` on later picks.
        for _ in 0..8 {
            let d = p.pick().clone();
            assert_ne!(d, b);
        }
        assert!(p.is_blacklisted(&b));
        assert!(!p.is_blacklisted(&a));
    }

    #[test]
    fn test_current_is_never_blacklisted() {
        let mut p = pool(3);
        for _ in 0..10 {
            let d = p.pick().clone();
            assert_eq!(p.current(), Some(&d));
            p.blacklist(&d);
            assert_eq!(p.current(), None);
        }

        // Blacklisting some other destination keeps the current one.
        let mut p = pool(3);
        let a = p.pick().clone();
        let b = p.pick().clone();
        p.blacklist(&a);
        assert_eq!(p.current(), Some(&b));
        assert!(!p.is_blacklisted(&b));
    }

    #[test]
    fn test_pick_after_blacklisting_current_moves_forward() {
        let mut p = pool(3);
        let a = p.pick().clone();
        p.blacklist(&a);
        let b = p.pick().clone();
        p.blacklist(&b);
        let c = p.pick().clone();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
    }

    #[test]
    fn test_duplicates_are_removed() {
        let p = DestinationPool::with_rng(
            vec![Destination::new("a", 1), Destination::new("a", 1)],
            StdRng::seed_from_u64(1),
        );
        assert_eq!(p.len(), 1);
    }
}
