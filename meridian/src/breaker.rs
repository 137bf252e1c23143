//! Circuit breakers: memory accounting for the memory-hungry subsystems.
//!
//! Every subsystem reports its estimated allocation before making it. A
//! child breaker refuses when its own limit would be exceeded; the parent
//! breaker refuses when the sum across children would exceed the node
//! budget. Reservations are RAII: dropping the reservation releases the
//! bytes.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakerKind {
    /// Columnar projections loaded for sorting/aggregating.
    FieldData,
    /// Per-in-flight-request transient memory.
    Request,
    /// Long-lived structures (segment metadata, caches).
    Accounting,
}

impl BreakerKind {
    pub fn name(&self) -> &'static str {
        match self {
            BreakerKind::FieldData => "fielddata",
            BreakerKind::Request => "request",
            BreakerKind::Accounting => "accounting",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerLimits {
    pub parent_limit: u64,
    pub field_data_limit: u64,
    pub request_limit: u64,
    pub accounting_limit: u64,
}

impl Default for BreakerLimits {
    fn default() -> Self {
        // Fractions of a nominal 1 GiB node budget.
        let gib = 1024 * 1024 * 1024u64;
        Self {
            parent_limit: gib * 70 / 100,
            field_data_limit: gib * 40 / 100,
            request_limit: gib * 40 / 100,
            accounting_limit: gib * 20 / 100,
        }
    }
}

struct ChildBreaker {
    kind: BreakerKind,
    limit: u64,
    used: AtomicU64,
    trips: AtomicU64,
}

pub struct CircuitBreakerService {
    parent_limit: u64,
    children: Vec<ChildBreaker>,
}

impl CircuitBreakerService {
    pub fn new(limits: BreakerLimits) -> Arc<CircuitBreakerService> {
        Arc::new(CircuitBreakerService {
            parent_limit: limits.parent_limit,
            children: vec![
                ChildBreaker {
                    kind: BreakerKind::FieldData,
                    limit: limits.field_data_limit,
                    used: AtomicU64::new(0),
                    trips: AtomicU64::new(0),
                },
                ChildBreaker {
                    kind: BreakerKind::Request,
                    limit: limits.request_limit,
                    used: AtomicU64::new(0),
                    trips: AtomicU64::new(0),
                },
                ChildBreaker {
                    kind: BreakerKind::Accounting,
                    limit: limits.accounting_limit,
                    used: AtomicU64::new(0),
                    trips: AtomicU64::new(0),
                },
            ],
        })
    }

    /// Reserve `bytes` against a child breaker, enforcing both the child
    /// limit and the parent budget across all children.
    pub fn try_reserve(
        self: &Arc<Self>,
        kind: BreakerKind,
        bytes: u64,
    ) -> Result<BreakerReservation> {
        let child = self.child(kind);
        let child_used = child.used.fetch_add(bytes, Ordering::SeqCst) + bytes;
        if child_used > child.limit {
            child.used.fetch_sub(bytes, Ordering::SeqCst);
            child.trips.fetch_add(1, Ordering::Relaxed);
            warn!(breaker = kind.name(), wanted = bytes, "circuit breaker tripped");
            return Err(Error::CircuitBreaking {
                breaker: kind.name(),
                wanted: bytes,
                limit: child.limit,
            });
        }
        let total: u64 = self
            .children
            .iter()
            .map(|c| c.used.load(Ordering::SeqCst))
            .sum();
        if total > self.parent_limit {
            child.used.fetch_sub(bytes, Ordering::SeqCst);
            child.trips.fetch_add(1, Ordering::Relaxed);
            warn!(
                breaker = "parent",
                wanted = bytes,
                total,
                "parent circuit breaker tripped"
            );
            return Err(Error::CircuitBreaking {
                breaker: "parent",
                wanted: bytes,
                limit: self.parent_limit,
            });
        }
        Ok(BreakerReservation {
            service: Arc::clone(self),
            kind,
            bytes,
        })
    }

    pub fn used(&self, kind: BreakerKind) -> u64 {
        self.child(kind).used.load(Ordering::SeqCst)
    }

    pub fn total_used(&self) -> u64 {
        self.children
            .iter()
            .map(|c| c.used.load(Ordering::SeqCst))
            .sum()
    }

    pub fn trips(&self, kind: BreakerKind) -> u64 {
        self.child(kind).trips.load(Ordering::Relaxed)
    }

    fn child(&self, kind: BreakerKind) -> &ChildBreaker {
        self.children
            .iter()
            .find(|c| c.kind == kind)
            .expect("all breaker kinds are registered")
    }

    fn release(&self, kind: BreakerKind, bytes: u64) {
        self.child(kind).used.fetch_sub(bytes, Ordering::SeqCst);
    }
}

/// RAII reservation; dropping releases the reserved bytes.
pub struct BreakerReservation {
    service: Arc<CircuitBreakerService>,
    kind: BreakerKind,
    bytes: u64,
}

impl Drop for BreakerReservation {
    fn drop(&mut self) {
        self.service.release(self.kind, self.bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(parent: u64, child: u64) -> BreakerLimits {
        BreakerLimits {
            parent_limit: parent,
            field_data_limit: child,
            request_limit: child,
            accounting_limit: child,
        }
    }

    #[test]
    fn test_reserve_and_release() {
        let service = CircuitBreakerService::new(limits(1000, 500));
        let reservation = service.try_reserve(BreakerKind::Request, 400).unwrap();
        assert_eq!(service.used(BreakerKind::Request), 400);
        drop(reservation);
        assert_eq!(service.used(BreakerKind::Request), 0);
    }

    #[test]
    fn test_child_limit_trips() {
        let service = CircuitBreakerService::new(limits(1000, 500));
        let _held = service.try_reserve(BreakerKind::Request, 400).unwrap();
        let err = service.try_reserve(BreakerKind::Request, 200).unwrap_err();
        assert!(matches!(
            err,
            Error::CircuitBreaking {
                breaker: "request",
                ..
            }
        ));
        assert_eq!(service.trips(BreakerKind::Request), 1);
        // A failed reservation must not leak accounting.
        assert_eq!(service.used(BreakerKind::Request), 400);
    }

    #[test]
    fn test_parent_limit_spans_children() {
        let service = CircuitBreakerService::new(limits(600, 500));
        let _a = service.try_reserve(BreakerKind::Request, 400).unwrap();
        let err = service.try_reserve(BreakerKind::FieldData, 300).unwrap_err();
        assert!(matches!(
            err,
            Error::CircuitBreaking {
                breaker: "parent",
                ..
            }
        ));
        assert_eq!(service.used(BreakerKind::FieldData), 0);
        assert_eq!(service.total_used(), 400);
    }

    #[test]
    fn test_recovers_after_release() {
        let service = CircuitBreakerService::new(limits(500, 500));
        let held = service.try_reserve(BreakerKind::Accounting, 500).unwrap();
        assert!(service.try_reserve(BreakerKind::Accounting, 1).is_err());
        drop(held);
        assert!(service.try_reserve(BreakerKind::Accounting, 1).is_ok());
    }
}
