//! Hierarchical CPU and memory accounting.
//!
//! A [`QuotaStack`] is a stack of nested accounting contexts consulted on
//! the hot dispatch path: every instruction charges a CPU tick and every
//! allocation-sized operation charges bytes. Reaching a hard limit kills the
//! current context and raises the unrecoverable termination signal, which
//! only the boundary that pushed the context may convert back into a normal
//! result.

use std::fmt::{self, Display};
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// How many CPU ticks elapse between wall-clock samples when a deadline is
/// set. Time is only ever advisory, so coarse sampling keeps the overhead
/// off the dispatch path.
pub const TIME_CHECK_GRANULARITY: u64 = 1024;

/// Approximate byte cost of one boxed value slot.
pub(crate) const VALUE_BYTES: u64 = 16;
/// Approximate byte cost of an empty table.
pub(crate) const TABLE_BYTES: u64 = 64;
/// Approximate byte cost of a closure shell.
pub(crate) const CLOSURE_BYTES: u64 = 32;
/// Approximate fixed byte cost of a continuation, before its registers.
pub(crate) const CONTINUATION_BYTES: u64 = 64;

/// A resource dimension tracked by the quota manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resource {
    Cpu,
    Memory,
}

impl Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Memory => f.write_str("memory"),
        }
    }
}

/// Capability flags a quota context grants to the code under it.
///
/// Capabilities only ever shrink when contexts nest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities(u32);

impl Capabilities {
    pub const NONE: Self = Self(0);
    /// Host I/O (files, streams).
    pub const IO: Self = Self(1);
    /// Wall-clock access.
    pub const TIME: Self = Self(1 << 1);
    /// Calling back into arbitrary host functions.
    pub const HOST: Self = Self(1 << 2);
    pub const ALL: Self = Self(u32::MAX);

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn intersect(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::ALL
    }
}

/// The configuration surface consumed when pushing a quota context.
///
/// Absent limits inherit the parent's remaining budget unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaDef {
    pub cpu_hard: Option<u64>,
    pub mem_hard: Option<u64>,
    pub cpu_soft: Option<u64>,
    pub mem_soft: Option<u64>,
    pub caps: Capabilities,
}

/// The lifecycle status of one quota context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaStatus {
    Live,
    Done,
    Error,
    Killed,
}

/// The payload of the unrecoverable termination signal: which limit was
/// breached, by which context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaBreach {
    pub resource: Resource,
    pub limit: u64,
    pub used: u64,
    /// The stack level of the killed context; the boundary that pushed that
    /// level is the only legal catch point.
    pub level: usize,
}

impl Display for QuotaBreach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} limit exceeded: used {} of {}",
            self.resource, self.used, self.limit
        )
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Account {
    hard: Option<u64>,
    soft: Option<u64>,
    used: u64,
}

impl Account {
    fn remaining_hard(&self) -> Option<u64> {
        self.hard.map(|hard| hard.saturating_sub(self.used))
    }

    fn remaining_soft(&self) -> Option<u64> {
        self.soft.map(|soft| soft.saturating_sub(self.used))
    }

    /// A child context can only be more restrictive than its parent.
    fn child(&self, requested_hard: Option<u64>, requested_soft: Option<u64>) -> Self {
        Self {
            hard: min_limit(requested_hard, self.remaining_hard()),
            soft: min_limit(requested_soft, self.remaining_soft()),
            used: 0,
        }
    }

    fn soft_exceeded(&self) -> bool {
        self.soft.is_some_and(|soft| self.used >= soft)
    }
}

fn min_limit(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(only), None) | (None, Some(only)) => Some(only),
        (None, None) => None,
    }
}

#[derive(Debug)]
struct QuotaContext {
    status: QuotaStatus,
    cpu: Account,
    mem: Account,
    caps: Capabilities,
}

/// One thread's stack of quota contexts. The root context is unlimited.
#[derive(Debug)]
pub struct QuotaStack {
    contexts: Vec<QuotaContext>,
    ticks_since_time_check: u64,
    deadline: Option<Instant>,
    deadline_expired: bool,
}

impl Default for QuotaStack {
    fn default() -> Self {
        Self::new()
    }
}

impl QuotaStack {
    #[must_use]
    pub fn new() -> Self {
        Self {
            contexts: vec![QuotaContext {
                status: QuotaStatus::Live,
                cpu: Account::default(),
                mem: Account::default(),
                caps: Capabilities::ALL,
            }],
            ticks_since_time_check: 0,
            deadline: None,
            deadline_expired: false,
        }
    }

    /// The stack level of the current context.
    #[must_use]
    pub fn level(&self) -> usize {
        self.contexts.len() - 1
    }

    #[must_use]
    pub fn status(&self) -> QuotaStatus {
        self.top().status
    }

    #[must_use]
    pub fn cpu_used(&self) -> u64 {
        self.top().cpu.used
    }

    #[must_use]
    pub fn mem_used(&self) -> u64 {
        self.top().mem.used
    }

    #[must_use]
    pub fn caps(&self) -> Capabilities {
        self.top().caps
    }

    /// Sets an advisory wall-clock deadline, surfaced through
    /// [`QuotaStack::should_cancel`] once crossed.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
        self.deadline_expired = false;
    }

    /// Enters a nested accounting context and returns its stack level.
    ///
    /// Effective limits are the minimum of the parent's remaining budget and
    /// the requested limits; capabilities intersect.
    pub fn push(&mut self, def: &QuotaDef) -> usize {
        let parent = self.top();
        let context = QuotaContext {
            status: QuotaStatus::Live,
            cpu: parent.cpu.child(def.cpu_hard, def.cpu_soft),
            mem: parent.mem.child(def.mem_hard, def.mem_soft),
            caps: parent.caps.intersect(def.caps),
        };
        self.contexts.push(context);
        self.level()
    }

    /// Leaves the current context, propagating its used totals into the
    /// parent so usage is conserved across nesting.
    ///
    /// # Panics
    ///
    /// Panics when called on the root context; push/pop pairing is an
    /// engine invariant.
    pub fn pop(&mut self) -> QuotaStatus {
        assert!(self.contexts.len() > 1, "cannot pop the root quota context");
        let mut popped = self.contexts.pop().expect("checked above");
        if popped.status == QuotaStatus::Live {
            popped.status = QuotaStatus::Done;
        }
        let parent = self.top_mut();
        parent.cpu.used = parent.cpu.used.saturating_add(popped.cpu.used);
        parent.mem.used = parent.mem.used.saturating_add(popped.mem.used);
        popped.status
    }

    /// Charges `n` CPU ticks against the current context.
    pub fn require_cpu(&mut self, n: u64) -> Result<(), QuotaBreach> {
        if self.deadline.is_some() {
            self.ticks_since_time_check += n;
            if self.ticks_since_time_check >= TIME_CHECK_GRANULARITY {
                self.ticks_since_time_check = 0;
                if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                    self.deadline_expired = true;
                }
            }
        }
        self.require(Resource::Cpu, n)
    }

    /// Charges `n` bytes against the current context.
    pub fn require_mem(&mut self, n: u64) -> Result<(), QuotaBreach> {
        self.require(Resource::Memory, n)
    }

    fn require(&mut self, resource: Resource, n: u64) -> Result<(), QuotaBreach> {
        let level = self.level();
        let context = self.top_mut();
        let account = match resource {
            Resource::Cpu => &mut context.cpu,
            Resource::Memory => &mut context.mem,
        };
        account.used = account.used.saturating_add(n);
        match account.hard {
            Some(limit) if account.used >= limit => {
                context.status = QuotaStatus::Killed;
                Err(QuotaBreach {
                    resource,
                    limit,
                    used: account.used,
                    level,
                })
            }
            _ => Ok(()),
        }
    }

    /// Non-fatal soft-limit poll: true when long-running code should
    /// cooperatively yield.
    #[must_use]
    pub fn should_cancel(&self) -> bool {
        let top = self.top();
        top.cpu.soft_exceeded() || top.mem.soft_exceeded() || self.deadline_expired
    }

    /// Whether the current context grants `caps`.
    #[must_use]
    pub fn allows(&self, caps: Capabilities) -> bool {
        self.top().caps.contains(caps)
    }

    pub(crate) fn mark_error(&mut self) {
        let top = self.top_mut();
        if top.status == QuotaStatus::Live {
            top.status = QuotaStatus::Error;
        }
    }

    fn top(&self) -> &QuotaContext {
        self.contexts.last().expect("root context always present")
    }

    fn top_mut(&mut self) -> &mut QuotaContext {
        self.contexts.last_mut().expect("root context always present")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_is_monotone_until_the_hard_limit() {
        let mut quotas = QuotaStack::new();
        quotas.push(&QuotaDef {
            cpu_hard: Some(10),
            ..QuotaDef::default()
        });
        let mut last = 0;
        for _ in 0..9 {
            quotas.require_cpu(1).unwrap();
            assert!(quotas.cpu_used() > last);
            last = quotas.cpu_used();
        }
        let breach = quotas.require_cpu(1).unwrap_err();
        assert_eq!(breach.resource, Resource::Cpu);
        assert_eq!(breach.limit, 10);
        assert_eq!(breach.used, 10);
        assert_eq!(quotas.status(), QuotaStatus::Killed);
    }

    #[test]
    fn child_limits_never_exceed_the_parent_remainder() {
        let mut quotas = QuotaStack::new();
        quotas.push(&QuotaDef {
            cpu_hard: Some(100),
            ..QuotaDef::default()
        });
        quotas.require_cpu(40).unwrap();
        // The child asks for more than the parent has left.
        quotas.push(&QuotaDef {
            cpu_hard: Some(1000),
            ..QuotaDef::default()
        });
        let breach = quotas.require_cpu(60).unwrap_err();
        assert_eq!(breach.limit, 60);
    }

    #[test]
    fn popping_conserves_usage() {
        let mut quotas = QuotaStack::new();
        quotas.push(&QuotaDef::default());
        quotas.require_cpu(5).unwrap();
        quotas.require_mem(128).unwrap();
        let before_cpu = quotas.cpu_used();

        quotas.push(&QuotaDef::default());
        assert_eq!(quotas.pop(), QuotaStatus::Done);
        assert_eq!(quotas.cpu_used(), before_cpu);

        quotas.push(&QuotaDef::default());
        quotas.require_cpu(7).unwrap();
        quotas.pop();
        assert_eq!(quotas.cpu_used(), before_cpu + 7);
        assert_eq!(quotas.mem_used(), 128);
    }

    #[test]
    fn soft_limits_only_advise() {
        let mut quotas = QuotaStack::new();
        quotas.push(&QuotaDef {
            cpu_soft: Some(3),
            ..QuotaDef::default()
        });
        assert!(!quotas.should_cancel());
        quotas.require_cpu(3).unwrap();
        assert!(quotas.should_cancel());
        // Still live: soft limits never kill.
        assert_eq!(quotas.status(), QuotaStatus::Live);
    }

    #[test]
    fn deadlines_advise_at_the_sampling_granularity() {
        let mut quotas = QuotaStack::new();
        // Already expired, but only noticed once enough ticks accumulate.
        quotas.set_deadline(Some(Instant::now()));
        quotas.require_cpu(TIME_CHECK_GRANULARITY - 1).unwrap();
        assert!(!quotas.should_cancel());
        quotas.require_cpu(1).unwrap();
        assert!(quotas.should_cancel());
        // Deadlines never kill.
        assert_eq!(quotas.status(), QuotaStatus::Live);
        quotas.set_deadline(None);
        assert!(!quotas.should_cancel());
    }

    #[test]
    fn capabilities_intersect_downward() {
        let mut quotas = QuotaStack::new();
        quotas.push(&QuotaDef {
            caps: Capabilities::IO.union(Capabilities::TIME),
            ..QuotaDef::default()
        });
        quotas.push(&QuotaDef {
            caps: Capabilities::ALL,
            ..QuotaDef::default()
        });
        assert!(quotas.allows(Capabilities::IO));
        quotas.pop();
        quotas.push(&QuotaDef {
            caps: Capabilities::TIME,
            ..QuotaDef::default()
        });
        assert!(!quotas.allows(Capabilities::IO));
        assert!(quotas.allows(Capabilities::TIME));
    }
}
