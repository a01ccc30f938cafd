//! Completion signals ("Fin") and per-operator execution profiles
//!
//! Exactly one Fin terminates each logical stream. It is produced once by the
//! operator at the head of a stream segment and consumed once by its direct
//! downstream consumer, which folds it into the Fin it emits itself.

use crate::error::{DistributedError, Result};
use crate::types::{now_millis, OperatorId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Failure carried by a `Fin::WithException`.
///
/// `origin` names the first failing fragment and is never rewritten on the
/// way downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub origin: String,
    pub message: String,
}

impl Failure {
    pub fn new(origin: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.origin, self.message)
    }
}

/// End-of-stream signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fin {
    /// Stream ended normally
    Plain,
    /// Stream ended normally; carries the profiles of every upstream operator
    WithProfiles(Vec<OperatorProfile>),
    /// Upstream pipeline aborted
    WithException(Failure),
}

impl Fin {
    pub fn failed(failure: Failure) -> Self {
        Fin::WithException(failure)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Fin::WithException(_))
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Fin::WithException(failure) => Some(failure),
            _ => None,
        }
    }

    pub fn profiles(&self) -> &[OperatorProfile] {
        match self {
            Fin::WithProfiles(profiles) => profiles,
            _ => &[],
        }
    }
}

/// Execution statistics of one operator instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorProfile {
    pub operator_id: OperatorId,
    pub kind: String,
    /// Unix millis of the first tuple or Fin processed; 0 until then
    pub start_ts: u64,
    /// Unix millis of the terminal Fin; 0 until then
    pub end_ts: u64,
    /// Data tuples handed downstream (or transmitted)
    pub processed: u64,
}

impl OperatorProfile {
    pub fn new(operator_id: OperatorId, kind: impl Into<String>) -> Self {
        Self {
            operator_id,
            kind: kind.into(),
            start_ts: 0,
            end_ts: 0,
            processed: 0,
        }
    }

    /// Record the start timestamp if it is not set yet
    pub fn start(&mut self) {
        if self.start_ts == 0 {
            self.start_ts = now_millis();
        }
    }

    pub fn record_tuple(&mut self) {
        self.processed += 1;
    }

    /// Stamp the end of processing and return the frozen profile
    pub fn finish(&mut self) -> OperatorProfile {
        self.start();
        self.end_ts = now_millis().max(self.start_ts);
        self.clone()
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.end_ts.saturating_sub(self.start_ts)
    }
}

/// Aggregates the Fins arriving on an operator's input pins.
///
/// A failure seen on any pin wins: later successful Fins cannot turn the
/// stream back into a success.
#[derive(Debug)]
pub struct FinCollector {
    received: Vec<bool>,
    profiles: Vec<OperatorProfile>,
    failure: Option<Failure>,
}

impl FinCollector {
    pub fn new(inputs: usize) -> Self {
        Self {
            received: vec![false; inputs],
            profiles: Vec::new(),
            failure: None,
        }
    }

    /// Fold in the Fin of one pin. Returns true once every pin has finished.
    pub fn absorb(&mut self, pin: usize, fin: Fin) -> Result<bool> {
        let slot = self.received.get_mut(pin).ok_or_else(|| {
            DistributedError::ProtocolViolation(format!("Fin on unknown input pin {}", pin))
        })?;
        if *slot {
            return Err(DistributedError::ProtocolViolation(format!(
                "Duplicate Fin on input pin {}",
                pin
            )));
        }
        *slot = true;

        match fin {
            Fin::Plain => {}
            Fin::WithProfiles(profiles) => self.profiles.extend(profiles),
            Fin::WithException(failure) => {
                if self.failure.is_none() {
                    self.failure = Some(failure);
                }
            }
        }
        Ok(self.is_complete())
    }

    /// Merge profiles that arrived outside a pin (e.g. over the network)
    pub fn merge_profiles(&mut self, profiles: &[OperatorProfile]) {
        self.profiles.extend_from_slice(profiles);
    }

    /// Record a failure that arrived outside a pin
    pub fn record_failure(&mut self, failure: Failure) {
        if self.failure.is_none() {
            self.failure = Some(failure);
        }
    }

    pub fn is_complete(&self) -> bool {
        self.received.iter().all(|r| *r)
    }

    pub fn failure(&self) -> Option<&Failure> {
        self.failure.as_ref()
    }

    /// Build the Fin to emit downstream, appending the operator's own profile
    pub fn finish(&mut self, own: OperatorProfile) -> Fin {
        match self.failure.clone() {
            Some(failure) => Fin::WithException(failure),
            None => {
                let mut profiles = std::mem::take(&mut self.profiles);
                profiles.push(own);
                Fin::WithProfiles(profiles)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(kind: &str) -> OperatorProfile {
        let mut p = OperatorProfile::new(OperatorId::new(), kind);
        p.finish()
    }

    #[test]
    fn test_profiles_accumulate_in_order() {
        let mut collector = FinCollector::new(1);
        let upstream = vec![profile("values"), profile("project")];
        assert!(collector
            .absorb(0, Fin::WithProfiles(upstream.clone()))
            .unwrap());

        let own = profile("send");
        let fin = collector.finish(own.clone());
        let mut expected = upstream;
        expected.push(own);
        assert_eq!(fin, Fin::WithProfiles(expected));
    }

    #[test]
    fn test_failure_is_never_overridden() {
        let mut collector = FinCollector::new(2);
        let failure = Failure::new("task-1/op-1", "boom");
        assert!(!collector
            .absorb(0, Fin::WithException(failure.clone()))
            .unwrap());
        assert!(collector
            .absorb(1, Fin::WithProfiles(vec![profile("values")]))
            .unwrap());

        assert_eq!(
            collector.finish(profile("union")),
            Fin::WithException(failure)
        );
    }

    #[test]
    fn test_first_failure_wins() {
        let mut collector = FinCollector::new(2);
        let first = Failure::new("a", "first");
        collector.absorb(0, Fin::failed(first.clone())).unwrap();
        collector
            .absorb(1, Fin::failed(Failure::new("b", "second")))
            .unwrap();
        assert_eq!(collector.failure(), Some(&first));
    }

    #[test]
    fn test_duplicate_fin_is_rejected() {
        let mut collector = FinCollector::new(1);
        collector.absorb(0, Fin::Plain).unwrap();
        assert!(matches!(
            collector.absorb(0, Fin::Plain),
            Err(DistributedError::ProtocolViolation(_))
        ));
        assert!(collector.absorb(3, Fin::Plain).is_err());
    }

    #[test]
    fn test_profile_finish_sets_both_timestamps() {
        let mut p = OperatorProfile::new(OperatorId::new(), "limit");
        let frozen = p.finish();
        assert!(frozen.start_ts > 0);
        assert!(frozen.end_ts >= frozen.start_ts);
        assert_eq!(frozen.processed, 0);
    }
}
