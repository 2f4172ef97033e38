// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-member circuit breakers for federated queries.
//!
//! A member that keeps failing or timing out would otherwise cost every
//! query a full member timeout. Once its circuit opens, fan-out skips it
//! with a `CircuitOpen` warning until `open_wait` has passed, then lets
//! `probe_calls` calls through to decide whether to close again.
//!
//! Backed by `recloser`; this module only adds per-member bookkeeping.

use crate::metrics;
use crate::types::MemberId;
use dashmap::DashMap;
use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Outcome of a call made through a member circuit.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// Circuit open; the call was never made.
    #[error("member circuit open")]
    Rejected,

    #[error(transparent)]
    Inner(E),
}

#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Size of the closed window; the circuit trips when (nearly) all of
    /// the calls in a full window failed.
    pub failure_threshold: u32,
    /// Calls let through while half-open.
    pub probe_calls: u32,
    pub open_wait: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            probe_calls: 1,
            open_wait: Duration::from_secs(30),
        }
    }
}

/// Circuit guarding calls to one member's connector.
pub struct MemberCircuit {
    member_id: MemberId,
    breaker: AsyncRecloser,
    /// Last observation: true after a rejection, false after any call went through.
    open: AtomicBool,
}

impl MemberCircuit {
    pub fn new(member_id: MemberId, config: &CircuitConfig) -> Self {
        let breaker = Recloser::custom()
            .error_rate(0.9)
            .closed_len(config.failure_threshold.max(1) as usize)
            .half_open_len(config.probe_calls.max(1) as usize)
            .open_wait(config.open_wait)
            .build();
        Self {
            member_id,
            breaker: breaker.into(),
            open: AtomicBool::new(false),
        }
    }

    pub fn member_id(&self) -> &MemberId {
        &self.member_id
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }

    /// Run `call` unless the circuit is open. Errors count against the member.
    pub async fn call<T, E, F>(&self, call: F) -> Result<T, CircuitError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        match self.breaker.call(call).await {
            Ok(value) => {
                self.observe(false);
                Ok(value)
            }
            Err(RecloserError::Inner(e)) => {
                self.observe(false);
                Err(CircuitError::Inner(e))
            }
            Err(RecloserError::Rejected) => {
                self.observe(true);
                Err(CircuitError::Rejected)
            }
        }
    }

    fn observe(&self, rejected: bool) {
        let was_open = self.open.swap(rejected, Ordering::Relaxed);
        if was_open == rejected {
            return;
        }
        metrics::set_member_circuit_open(self.member_id.as_str(), rejected);
        if rejected {
            warn!(member_id = %self.member_id, "Member circuit opened, skipping member");
        } else {
            info!(member_id = %self.member_id, "Member circuit passing calls again");
        }
    }
}

/// Circuits for every member queried so far, created on first use.
pub struct MemberCircuits {
    config: CircuitConfig,
    circuits: DashMap<MemberId, Arc<MemberCircuit>>,
}

impl MemberCircuits {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            circuits: DashMap::new(),
        }
    }

    pub fn for_member(&self, member_id: &MemberId) -> Arc<MemberCircuit> {
        self.circuits
            .entry(member_id.clone())
            .or_insert_with(|| Arc::new(MemberCircuit::new(member_id.clone(), &self.config)))
            .clone()
    }

    /// Forget a member that left the cohort.
    pub fn remove(&self, member_id: &MemberId) {
        if self.circuits.remove(member_id).is_some() {
            metrics::set_member_circuit_open(member_id.as_str(), false);
        }
    }

    /// Members whose circuit was open on their last call, sorted.
    pub fn likely_open(&self) -> Vec<MemberId> {
        let mut open: Vec<MemberId> = self
            .circuits
            .iter()
            .filter(|entry| entry.value().is_open())
            .map(|entry| entry.key().clone())
            .collect();
        open.sort();
        open
    }
}
