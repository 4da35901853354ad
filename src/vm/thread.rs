//! Cooperative threads and per-thread quota accounting.
//!
//! A thread is a resumable execution context, not an OS thread. Resuming one
//! drives its trampoline inside the caller's native frame; yielding unwinds
//! that single frame by raising the yield signal, so suspension never
//! captures native stack. Native nesting depth therefore tracks the depth of
//! *active* resumes, not the number of threads.

use std::cell::{Cell as StdCell, RefCell};
use std::fmt::{self, Debug};
use std::rc::Rc;
use std::time::Instant;

use tracing::debug;

use crate::runtime::value::Value;
use crate::vm::continuation::{Continuation, NativeFn};
use crate::vm::quota::{Capabilities, QuotaBreach, QuotaDef, QuotaStack, QuotaStatus};
use crate::vm::{run, Fault, Runtime, YieldSignal};

/// Where a thread is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Not started, or parked at a yield.
    Suspended,
    /// Currently driving a trampoline, or having suspended itself to resume
    /// another thread.
    Running,
    /// Finished or failed; can never run again.
    Dead,
}

/// What a quota boundary observed about the code it governed.
#[derive(Debug)]
pub struct QuotaOutcome<R> {
    pub status: QuotaStatus,
    pub cpu_used: u64,
    pub mem_used: u64,
    /// The body's value, or the breach when its own limit killed it.
    pub result: Result<R, QuotaBreach>,
}

struct ThreadState {
    runtime: Runtime,
    quotas: RefCell<QuotaStack>,
    status: StdCell<ThreadStatus>,
    /// The not-yet-started coroutine body. Taken on first resume.
    body: RefCell<Option<Value>>,
    /// Where a suspended coroutine picks up, set by the yield that parked it.
    resume_at: RefCell<Option<Continuation>>,
    /// The sink collecting the body's final results across resumes.
    sink: RefCell<Option<Continuation>>,
    /// The thread currently waiting on this one, while running.
    caller: RefCell<Option<Thread>>,
}

/// A cooperative thread of execution with its own quota stack.
#[derive(Clone)]
pub struct Thread(Rc<ThreadState>);

impl Thread {
    fn new(runtime: &Runtime, status: ThreadStatus, body: Option<Value>) -> Self {
        Self(Rc::new(ThreadState {
            runtime: runtime.clone(),
            quotas: RefCell::new(QuotaStack::new()),
            status: StdCell::new(status),
            body: RefCell::new(body),
            resume_at: RefCell::new(None),
            sink: RefCell::new(None),
            caller: RefCell::new(None),
        }))
    }

    /// The implicit top-level thread of a runtime. It is always `Running`
    /// and cannot yield.
    pub(crate) fn root(runtime: &Runtime) -> Self {
        Self::new(runtime, ThreadStatus::Running, None)
    }

    /// Creates a suspended thread that will call `body` with the arguments
    /// of its first resume.
    #[must_use]
    pub fn spawn(runtime: &Runtime, body: Value) -> Self {
        Self::new(runtime, ThreadStatus::Suspended, Some(body))
    }

    #[must_use]
    pub fn runtime(&self) -> &Runtime {
        &self.0.runtime
    }

    #[must_use]
    pub fn status(&self) -> ThreadStatus {
        self.0.status.get()
    }

    /// The thread waiting on this one. `None` while suspended, and always
    /// `None` for the root thread.
    #[must_use]
    pub fn caller(&self) -> Option<Thread> {
        self.0.caller.borrow().clone()
    }

    /// Resumes this thread, transferring `args` to it, and returns either
    /// the values it yields or its final results once it finishes.
    ///
    /// A catchable error inside the thread kills it and propagates to the
    /// caller; a dead thread stays dead.
    pub fn resume(&self, caller: &Thread, args: Vec<Value>) -> Result<Vec<Value>, Fault> {
        assert!(
            self.0.runtime.ptr_eq(caller.runtime()),
            "threads cannot migrate between runtimes"
        );
        match self.status() {
            ThreadStatus::Running => {
                return Err(Fault::error("attempt to resume a running thread"));
            }
            ThreadStatus::Dead => return Err(Fault::error("attempt to resume a dead thread")),
            ThreadStatus::Suspended => {}
        }
        let start = match self.prepare(args) {
            Ok(start) => start,
            Err(fault) => {
                self.0.status.set(ThreadStatus::Dead);
                return Err(fault);
            }
        };
        caller.0.status.set(ThreadStatus::Suspended);
        self.0.status.set(ThreadStatus::Running);
        *self.0.caller.borrow_mut() = Some(caller.clone());
        debug!(target: "coil::thread", "resuming");

        let outcome = run(self, start);

        *self.0.caller.borrow_mut() = None;
        caller.0.status.set(ThreadStatus::Running);
        match outcome {
            Ok(()) => {
                self.0.status.set(ThreadStatus::Dead);
                let results = self
                    .0
                    .sink
                    .borrow_mut()
                    .take()
                    .and_then(|sink| sink.termination_results())
                    .unwrap_or_default();
                Ok(results)
            }
            Err(Fault::Yield(signal)) => {
                self.0.status.set(ThreadStatus::Suspended);
                let YieldSignal { values, resume_at } = *signal;
                *self.0.resume_at.borrow_mut() = Some(resume_at);
                Ok(values)
            }
            Err(other) => {
                self.0.status.set(ThreadStatus::Dead);
                Err(other)
            }
        }
    }

    /// Builds the continuation this resume starts from and delivers `args`
    /// to it.
    fn prepare(&self, args: Vec<Value>) -> Result<Continuation, Fault> {
        let start = match self.0.body.borrow_mut().take() {
            Some(body) => {
                let sink = Continuation::termination_all();
                *self.0.sink.borrow_mut() = Some(sink.clone());
                Continuation::for_call(self, &body, sink)?
            }
            None => self
                .0
                .resume_at
                .borrow_mut()
                .take()
                .ok_or_else(|| Fault::error("thread has no pending continuation"))?,
        };
        start.push_seq(args)?;
        Ok(start)
    }

    /// Runs `body` under a nested quota context.
    ///
    /// A hard-limit breach raised by this context surfaces as the `Err` arm
    /// of [`QuotaOutcome::result`]; a breach belonging to an enclosing
    /// context keeps propagating, because only the boundary that pushed a
    /// context may absorb its kill.
    pub fn with_quota<R>(
        &self,
        def: &QuotaDef,
        body: impl FnOnce(&Thread) -> Result<R, Fault>,
    ) -> Result<QuotaOutcome<R>, Fault> {
        let level = self.0.quotas.borrow_mut().push(def);
        let result = body(self);
        let mut quotas = self.0.quotas.borrow_mut();
        debug_assert_eq!(quotas.level(), level, "unbalanced quota nesting");
        if matches!(result, Err(Fault::Error(_))) {
            quotas.mark_error();
        }
        let cpu_used = quotas.cpu_used();
        let mem_used = quotas.mem_used();
        let status = quotas.pop();
        drop(quotas);
        match result {
            Ok(value) => Ok(QuotaOutcome {
                status,
                cpu_used,
                mem_used,
                result: Ok(value),
            }),
            Err(Fault::Kill(breach)) if breach.level == level => {
                debug!(target: "coil::thread", %breach, "quota boundary absorbed a kill");
                Ok(QuotaOutcome {
                    status,
                    cpu_used,
                    mem_used,
                    result: Err(breach),
                })
            }
            Err(other) => Err(other),
        }
    }

    pub(crate) fn charge_cpu(&self, n: u64) -> Result<(), Fault> {
        self.0.quotas.borrow_mut().require_cpu(n).map_err(Fault::Kill)
    }

    pub(crate) fn charge_mem(&self, n: u64) -> Result<(), Fault> {
        self.0.quotas.borrow_mut().require_mem(n).map_err(Fault::Kill)
    }

    /// Non-fatal poll: true once a soft limit or the wall-clock deadline has
    /// been crossed.
    #[must_use]
    pub fn should_cancel(&self) -> bool {
        self.0.quotas.borrow().should_cancel()
    }

    /// Whether the current quota context grants `caps`.
    #[must_use]
    pub fn allows(&self, caps: Capabilities) -> bool {
        self.0.quotas.borrow().allows(caps)
    }

    /// Sets or clears this thread's advisory wall-clock deadline.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.0.quotas.borrow_mut().set_deadline(deadline);
    }

    #[must_use]
    pub fn cpu_used(&self) -> u64 {
        self.0.quotas.borrow().cpu_used()
    }

    #[must_use]
    pub fn mem_used(&self) -> u64 {
        self.0.quotas.borrow().mem_used()
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// The `yield` primitive as a host function: suspends the innermost resumed
/// thread, handing its variadic arguments to the resumer.
#[must_use]
pub fn yield_fn() -> NativeFn {
    NativeFn::new("yield", 0, true, |thread, args| {
        if thread.caller().is_none() {
            return Err(Fault::error("attempt to yield from outside a coroutine"));
        }
        Err(Fault::Yield(Box::new(YieldSignal {
            values: args.all(),
            // The yield call's own continuation is exactly where the next
            // resume should deliver its arguments.
            resume_at: args.next.clone(),
        })))
    })
}

/// The `resume` primitive as a host function: first argument is the thread,
/// the rest are transferred to it.
#[must_use]
pub fn resume_fn() -> NativeFn {
    NativeFn::new("resume", 1, true, |thread, args| {
        let Value::Thread(target) = args.arg(0) else {
            return Err(Fault::error(format!(
                "attempt to resume a {} value",
                args.arg(0).type_name()
            )));
        };
        let results = target.resume(thread, args.etc.to_vec())?;
        args.next.push_seq(results)?;
        Ok(Some(args.next.clone()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::call_value;

    #[test]
    fn root_thread_cannot_yield() {
        let runtime = Runtime::new();
        let thread = runtime.root_thread();
        let error =
            call_value(&thread, &Value::Native(yield_fn()), Vec::new()).unwrap_err();
        let Fault::Error(error) = error else {
            panic!("expected a catchable error");
        };
        assert!(error.message().to_string().contains("outside a coroutine"));
    }

    #[test]
    fn a_thread_runs_its_body_to_completion() {
        let runtime = Runtime::new();
        let root = runtime.root_thread();
        let body = NativeFn::new("body", 0, true, |_thread, args| {
            args.next.push(Value::Int(42))?;
            Ok(Some(args.next.clone()))
        });
        let thread = Thread::spawn(&runtime, Value::Native(body));
        assert_eq!(thread.status(), ThreadStatus::Suspended);
        let results = thread.resume(&root, Vec::new()).unwrap();
        assert_eq!(thread.status(), ThreadStatus::Dead);
        assert!(results[0].equals(&Value::Int(42)));
    }

    #[test]
    fn resuming_a_dead_thread_fails() {
        let runtime = Runtime::new();
        let root = runtime.root_thread();
        let body = NativeFn::new("body", 0, false, |_thread, args| {
            Ok(Some(args.next.clone()))
        });
        let thread = Thread::spawn(&runtime, Value::Native(body));
        thread.resume(&root, Vec::new()).unwrap();
        let error = thread.resume(&root, Vec::new()).unwrap_err();
        assert!(matches!(error, Fault::Error(_)));
    }

    #[test]
    fn yield_suspends_and_resume_delivers() {
        let runtime = Runtime::new();
        let root = runtime.root_thread();
        // A native body can only yield as its final action; its next
        // continuation is where the second resume's arguments land.
        let body = NativeFn::new("body", 0, true, |thread, args| {
            assert!(thread.caller().is_some());
            Err(Fault::Yield(Box::new(YieldSignal {
                values: vec![Value::Int(10)],
                resume_at: args.next.clone(),
            })))
        });
        let thread = Thread::spawn(&runtime, Value::Native(body));

        let yielded = thread.resume(&root, Vec::new()).unwrap();
        assert_eq!(thread.status(), ThreadStatus::Suspended);
        assert!(yielded[0].equals(&Value::Int(10)));

        let finished = thread.resume(&root, vec![Value::Int(5)]).unwrap();
        assert_eq!(thread.status(), ThreadStatus::Dead);
        assert!(finished[0].equals(&Value::Int(5)));
    }

    #[test]
    fn the_resume_primitive_transfers_values() {
        let runtime = Runtime::new();
        let root = runtime.root_thread();
        let body = NativeFn::new("body", 0, true, |_thread, args| {
            Err(Fault::Yield(Box::new(YieldSignal {
                values: vec![Value::Int(1)],
                resume_at: args.next.clone(),
            })))
        });
        let thread = Thread::spawn(&runtime, Value::Native(body));
        let results = call_value(
            &root,
            &Value::Native(resume_fn()),
            vec![Value::Thread(thread.clone())],
        )
        .unwrap();
        assert!(results[0].equals(&Value::Int(1)));
        assert_eq!(thread.status(), ThreadStatus::Suspended);
    }

    #[test]
    fn quota_boundary_reports_usage_and_status() {
        let runtime = Runtime::new();
        let thread = runtime.root_thread();
        let outcome = thread
            .with_quota(&QuotaDef::default(), |thread| {
                thread.charge_cpu(12)?;
                thread.charge_mem(256)?;
                Ok(7)
            })
            .unwrap();
        assert_eq!(outcome.status, QuotaStatus::Done);
        assert_eq!(outcome.cpu_used, 12);
        assert_eq!(outcome.mem_used, 256);
        assert_eq!(outcome.result.unwrap(), 7);
    }

    #[test]
    fn a_kill_is_absorbed_only_at_its_own_boundary() {
        let runtime = Runtime::new();
        let thread = runtime.root_thread();
        let outer = thread
            .with_quota(
                &QuotaDef {
                    cpu_hard: Some(100),
                    ..QuotaDef::default()
                },
                |thread| {
                    // The inner boundary's limit is looser than the outer
                    // remainder, so the breach belongs to the inner level.
                    let inner = thread.with_quota(
                        &QuotaDef {
                            cpu_hard: Some(10),
                            ..QuotaDef::default()
                        },
                        |thread| thread.charge_cpu(50).map(|()| 0),
                    )?;
                    assert_eq!(inner.status, QuotaStatus::Killed);
                    assert!(inner.result.is_err());
                    Ok(1)
                },
            )
            .unwrap();
        assert_eq!(outer.status, QuotaStatus::Done);
        assert_eq!(outer.result.unwrap(), 1);
    }

    #[test]
    fn inherited_limits_bind_at_the_inner_boundary() {
        let runtime = Runtime::new();
        let thread = runtime.root_thread();
        let outcome = thread
            .with_quota(
                &QuotaDef {
                    cpu_hard: Some(10),
                    ..QuotaDef::default()
                },
                |thread| {
                    thread.charge_cpu(8)?;
                    // Inherits the outer remainder of 2; the breach is
                    // recorded against this inner level.
                    let inner = thread.with_quota(&QuotaDef::default(), |thread| {
                        thread.charge_cpu(5).map(|()| ())
                    })?;
                    assert!(inner.result.is_err());
                    Ok(())
                },
            )
            .unwrap();
        assert_eq!(outcome.status, QuotaStatus::Done);
    }

    #[test]
    fn capabilities_are_checked_through_the_thread() {
        let runtime = Runtime::new();
        let thread = runtime.root_thread();
        assert!(thread.allows(Capabilities::IO));
        thread
            .with_quota(
                &QuotaDef {
                    caps: Capabilities::TIME,
                    ..QuotaDef::default()
                },
                |thread| {
                    assert!(!thread.allows(Capabilities::IO));
                    assert!(thread.allows(Capabilities::TIME));
                    Ok(())
                },
            )
            .unwrap();
        assert!(thread.allows(Capabilities::IO));
    }
}
