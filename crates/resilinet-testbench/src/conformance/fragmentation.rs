//! Fragmentation and reassembly coverage
//!
//! A datagram of `original_size` payload bytes crossing a link with `mtu`
//! must arrive as `ceil(original_size / per_fragment)` pieces, where
//! `per_fragment` is the largest multiple of 8 that fits after the IPv4
//! header. Every piece but the last sets "more fragments".

use super::events::{EventKind, ProtocolEvent};
use super::packet::IPV4_HEADER_LEN;
use super::verdict::{Evidence, FailureKind, FailureRecord};
use std::fmt;

pub const ASSERTION: &str = "fragmentation";

/// What a correct fragmentation looks like
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FragmentPlan {
    pub original_size: usize,
    pub mtu: usize,
    pub per_fragment: usize,
    pub offsets: Vec<usize>,
}

impl FragmentPlan {
    pub fn new(original_size: usize, mtu: usize) -> Self {
        let per_fragment = (mtu.saturating_sub(IPV4_HEADER_LEN) / 8 * 8).max(8);
        let offsets = if original_size + IPV4_HEADER_LEN <= mtu {
            vec![0]
        } else {
            (0..original_size).step_by(per_fragment).collect()
        };
        Self {
            original_size,
            mtu,
            per_fragment,
            offsets,
        }
    }

    pub fn expected_count(&self) -> usize {
        self.offsets.len()
    }
}

impl fmt::Display for FragmentPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let offsets: Vec<String> = self.offsets.iter().map(|o| o.to_string()).collect();
        write!(
            f,
            "{} fragment(s) of {} bytes for mtu {} at offsets [{}], last without MF",
            self.expected_count(),
            self.original_size,
            self.mtu,
            offsets.join(", ")
        )
    }
}

#[derive(Clone, Copy, Debug)]
struct Piece {
    offset: usize,
    len: usize,
    more_fragments: bool,
}

/// Collects the pieces of one datagram, keyed by the first IP id seen
#[derive(Clone, Debug, Default)]
pub struct FragmentTracker {
    datagram_id: Option<u16>,
    events: Vec<ProtocolEvent>,
    pieces: Vec<Piece>,
}

impl FragmentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an event; returns true if it belonged to the tracked datagram
    pub fn observe(&mut self, event: &ProtocolEvent) -> bool {
        let EventKind::FragmentObserved {
            id,
            offset,
            more_fragments,
            payload_len,
            ..
        } = event.kind
        else {
            return false;
        };

        match self.datagram_id {
            Some(tracked) if tracked != id => return false,
            None => self.datagram_id = Some(id),
            _ => {}
        }

        // Duplicates carry nothing new
        if self.pieces.iter().any(|p| p.offset == offset && p.len == payload_len) {
            return true;
        }

        self.events.push(*event);
        self.pieces.push(Piece {
            offset,
            len: payload_len,
            more_fragments,
        });
        true
    }

    /// Whether the pieces seen so far cover a whole datagram
    pub fn is_complete(&self) -> bool {
        self.coverage().is_some()
    }

    pub fn fragment_count(&self) -> usize {
        self.pieces.len()
    }

    /// Reassembled length, if coverage is contiguous from 0 to a final piece
    fn coverage(&self) -> Option<usize> {
        let mut sorted = self.pieces.clone();
        sorted.sort_by_key(|p| p.offset);

        let mut end = 0;
        for piece in &sorted {
            if piece.offset != end {
                return None;
            }
            end += piece.len;
            if !piece.more_fragments {
                return Some(end);
            }
        }
        None
    }

    /// Judge the collected pieces against `plan`
    pub fn evaluate(&self, plan: &FragmentPlan, waited_ms: u64) -> Result<(), FailureRecord> {
        if self.pieces.is_empty() {
            return Err(FailureRecord::new(
                ASSERTION,
                FailureKind::ObservationTimeout,
                plan.to_string(),
                Evidence::Absent {
                    waited_ms,
                    detail: "no fragments observed".to_string(),
                },
            ));
        }

        let evidence = Evidence::Events {
            events: self.events.clone(),
        };

        match self.coverage() {
            Some(len) if len == plan.original_size => {}
            _ => {
                return Err(FailureRecord::new(
                    ASSERTION,
                    FailureKind::ReassemblyIncomplete,
                    plan.to_string(),
                    evidence,
                ))
            }
        }

        let mut sorted = self.pieces.clone();
        sorted.sort_by_key(|p| p.offset);
        let offsets: Vec<usize> = sorted.iter().map(|p| p.offset).collect();
        let flags_ok = sorted
            .iter()
            .enumerate()
            .all(|(i, p)| p.more_fragments == (i + 1 < sorted.len()));

        if offsets != plan.offsets || !flags_ok {
            return Err(FailureRecord::new(
                ASSERTION,
                FailureKind::FragmentCountMismatch,
                plan.to_string(),
                evidence,
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn fragment(id: u16, offset: usize, len: usize, more: bool) -> ProtocolEvent {
        ProtocolEvent {
            at: Duration::from_micros(offset as u64),
            src: Ipv4Addr::new(10, 0, 1, 1),
            dst: Ipv4Addr::new(10, 0, 1, 2),
            kind: EventKind::FragmentObserved {
                id,
                protocol: 17,
                offset,
                more_fragments: more,
                payload_len: len,
            },
        }
    }

    fn track(events: &[ProtocolEvent]) -> FragmentTracker {
        let mut tracker = FragmentTracker::new();
        for event in events {
            tracker.observe(event);
        }
        tracker
    }

    #[test]
    fn test_plan_for_standard_mtu() {
        let plan = FragmentPlan::new(3000, 1500);
        assert_eq!(plan.per_fragment, 1480);
        assert_eq!(plan.offsets, vec![0, 1480, 2960]);

        // Per-fragment payload is rounded down to a multiple of 8
        let plan = FragmentPlan::new(1000, 576);
        assert_eq!(plan.per_fragment, 552);
        assert_eq!(plan.expected_count(), 2);

        // Fits in one datagram
        assert_eq!(FragmentPlan::new(1480, 1500).offsets, vec![0]);
    }

    #[test]
    fn test_out_of_order_arrival_is_fine() {
        let tracker = track(&[
            fragment(5, 2960, 40, false),
            fragment(5, 0, 1480, true),
            fragment(5, 1480, 1480, true),
        ]);
        assert!(tracker.is_complete());
        assert!(tracker.evaluate(&FragmentPlan::new(3000, 1500), 10).is_ok());
    }

    #[test]
    fn test_other_datagrams_ignored() {
        let mut tracker = FragmentTracker::new();
        assert!(tracker.observe(&fragment(5, 0, 1480, true)));
        assert!(!tracker.observe(&fragment(6, 0, 1480, true)));
        assert_eq!(tracker.fragment_count(), 1);
    }

    #[test]
    fn test_duplicates_not_counted() {
        let tracker = track(&[
            fragment(5, 0, 1480, true),
            fragment(5, 0, 1480, true),
            fragment(5, 1480, 1480, true),
            fragment(5, 2960, 40, false),
        ]);
        assert_eq!(tracker.fragment_count(), 3);
        assert!(tracker.evaluate(&FragmentPlan::new(3000, 1500), 10).is_ok());
    }

    #[test]
    fn test_wrong_split_is_count_mismatch() {
        // Complete coverage, but split for a smaller MTU than the link has
        let tracker = track(&[
            fragment(5, 0, 1000, true),
            fragment(5, 1000, 1000, true),
            fragment(5, 2000, 1000, false),
        ]);
        let failure = tracker.evaluate(&FragmentPlan::new(3000, 1500), 10).unwrap_err();
        assert_eq!(failure.kind, FailureKind::FragmentCountMismatch);
    }

    #[test]
    fn test_wrong_total_is_incomplete() {
        let tracker = track(&[fragment(5, 0, 1480, true), fragment(5, 1480, 100, false)]);
        let failure = tracker.evaluate(&FragmentPlan::new(3000, 1500), 10).unwrap_err();
        assert_eq!(failure.kind, FailureKind::ReassemblyIncomplete);
    }

    #[test]
    fn test_nothing_seen_is_timeout() {
        let failure = FragmentTracker::new()
            .evaluate(&FragmentPlan::new(3000, 1500), 250)
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::ObservationTimeout);
    }
}
