//! Ambient metrics stack, carried regardless of spec.md's Non-goals (which
//! exclude admin CRUD surfaces, not observability). Exposes the counters a
//! scheduler node's loops touch on every iteration, registered into a
//! `prometheus::Registry` served under `/metrics`.

use prometheus::{Histogram, HistogramOpts, IntCounterVec, Opts, Registry};

pub struct Metrics {
    /// Labelled by outcome: "preempted", "lost_race".
    pub preempt_attempts: IntCounterVec,
    /// Labelled by reported status (spec.md §4.3 dispatch table).
    pub execution_transitions: IntCounterVec,
    /// Labelled by compensator name: "retry", "reschedule", "interrupt".
    pub compensator_sweeps: IntCounterVec,
    pub schedule_loop_batch_size: Histogram,
}

pub fn register_all() -> (Registry, Metrics) {
    let registry = Registry::new();

    let preempt_attempts = IntCounterVec::new(
        Opts::new(
            "scheduler_preempt_attempts_total",
            "Task preemption CAS attempts by outcome",
        ),
        &["outcome"],
    )
    .expect("static metric definition is always valid");

    let execution_transitions = IntCounterVec::new(
        Opts::new(
            "scheduler_execution_transitions_total",
            "Execution state machine transitions by reported status",
        ),
        &["status"],
    )
    .expect("static metric definition is always valid");

    let compensator_sweeps = IntCounterVec::new(
        Opts::new(
            "scheduler_compensator_sweeps_total",
            "Compensator loop sweeps by loop name",
        ),
        &["loop_name"],
    )
    .expect("static metric definition is always valid");

    let schedule_loop_batch_size = Histogram::with_opts(HistogramOpts::new(
        "scheduler_schedule_loop_batch_size",
        "Number of schedulable tasks returned per schedule-loop iteration",
    ))
    .expect("static metric definition is always valid");

    registry
        .register(Box::new(preempt_attempts.clone()))
        .expect("metric name collision");
    registry
        .register(Box::new(execution_transitions.clone()))
        .expect("metric name collision");
    registry
        .register(Box::new(compensator_sweeps.clone()))
        .expect("metric name collision");
    registry
        .register(Box::new(schedule_loop_batch_size.clone()))
        .expect("metric name collision");

    (
        registry,
        Metrics {
            preempt_attempts,
            execution_transitions,
            compensator_sweeps,
            schedule_loop_batch_size,
        },
    )
}
