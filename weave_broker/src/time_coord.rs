//! Conservative time coordination.
//!
//! One [`TimeCoordinator`] runs per hosted federate. It tracks what every
//! dependency has promised (the earliest time it might still produce an
//! event, `te`, plus its granted time and whether it is iterating) and decides
//! when the federate may advance. The invariant: a federate is never granted a
//! time its dependencies could still send events before.
//!
//! The coordinator is a pure state machine; the owning core feeds it messages
//! and forwards its reports.

use std::collections::{BTreeMap, BTreeSet};

use weave_core::{GlobalId, IterationRequest, IterationResult, Time};

/// Per-federate timing properties, set before entering execution.
#[derive(Debug, Clone, Copy)]
pub struct TimeProps {
    /// Minimum step between grants.
    pub time_delta: Time,
    /// If nonzero, grants snap to `offset + k * period`.
    pub period: Time,
    pub offset: Time,
    /// Delay added to all incoming event times.
    pub input_delay: Time,
    /// Delay added to all outgoing event times.
    pub output_delay: Time,
    /// Cap on consecutive iterations at one time.
    pub max_iterations: u16,
    /// Pace grants against the wall clock.
    pub realtime: bool,
    pub rt_lag: Time,
    pub rt_lead: Time,
}

impl Default for TimeProps {
    fn default() -> Self {
        Self {
            time_delta: Time::EPSILON,
            period: Time::ZERO,
            offset: Time::ZERO,
            input_delay: Time::ZERO,
            output_delay: Time::ZERO,
            max_iterations: 50,
            realtime: false,
            rt_lag: Time::from_millis(10),
            rt_lead: Time::from_millis(10),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum TimeState {
    #[default]
    Initializing,
    TimeGranted,
    TimeRequested,
}

/// What we know about one dependency's progress.
#[derive(Debug, Clone, Copy)]
pub struct DependencyInfo {
    /// Earliest time the dependency might still produce an event.
    pub te: Time,
    /// Its minimum delta to a subsequent event.
    pub tdemin: Time,
    /// Last granted time it reported.
    pub granted: Time,
    pub iterating: bool,
}

impl Default for DependencyInfo {
    fn default() -> Self {
        Self {
            te: Time::INITIALIZATION,
            tdemin: Time::EPSILON,
            granted: Time::INITIALIZATION,
            iterating: false,
        }
    }
}

/// A grant decision handed back to the federate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grant {
    pub time: Time,
    pub result: IterationResult,
}

/// The report a coordinator exposes to whoever depends on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeReport {
    pub te: Time,
    pub tdemin: Time,
    pub granted: Time,
    pub iterating: bool,
}

#[derive(Debug)]
pub struct TimeCoordinator {
    id: GlobalId,
    pub props: TimeProps,
    state: TimeState,
    current_time: Time,
    requested: Time,
    iteration_request: IterationRequest,
    iterations: u16,
    /// Earliest pending inbound event queued for this federate.
    event_time: Time,
    /// An event with genuinely new data arrived at or before the request
    /// horizon; drives `IterateIfNeeded`.
    has_new_data: bool,
    barrier: Option<Time>,
    dependencies: BTreeMap<GlobalId, DependencyInfo>,
    dependents: BTreeSet<GlobalId>,
}

impl TimeCoordinator {
    pub fn new(id: GlobalId, props: TimeProps) -> Self {
        Self {
            id,
            props,
            state: TimeState::Initializing,
            current_time: Time::INITIALIZATION,
            requested: Time::INITIALIZATION,
            iteration_request: IterationRequest::NoIterations,
            iterations: 0,
            event_time: Time::MAX_TIME,
            has_new_data: false,
            barrier: None,
            dependencies: BTreeMap::new(),
            dependents: BTreeSet::new(),
        }
    }

    pub fn current_time(&self) -> Time {
        self.current_time
    }

    pub fn state(&self) -> TimeState {
        self.state
    }

    pub fn has_dependencies(&self) -> bool {
        !self.dependencies.is_empty()
    }

    pub fn has_dependents(&self) -> bool {
        !self.dependents.is_empty()
    }

    pub fn dependencies(&self) -> impl Iterator<Item = GlobalId> + '_ {
        self.dependencies.keys().copied()
    }

    /// Self-loops are collapsed: a federate never waits on itself.
    pub fn add_dependency(&mut self, id: GlobalId) {
        if id != self.id {
            self.dependencies.entry(id).or_default();
        }
    }

    pub fn remove_dependency(&mut self, id: GlobalId) {
        self.dependencies.remove(&id);
    }

    pub fn add_dependent(&mut self, id: GlobalId) {
        if id != self.id {
            self.dependents.insert(id);
        }
    }

    pub fn remove_dependent(&mut self, id: GlobalId) {
        self.dependents.remove(&id);
    }

    pub fn set_barrier(&mut self, time: Time) {
        self.barrier = Some(time);
    }

    pub fn clear_barrier(&mut self) {
        self.barrier = None;
    }

    /// Mark the federation as executing: time moves from the initialization
    /// sentinel to zero.
    pub fn enter_executing(&mut self) {
        self.state = TimeState::TimeGranted;
        self.current_time = Time::ZERO;
        self.iterations = 0;
    }

    /// Record an inbound event queued for this federate at `time`; `changed`
    /// is whether it carries data different from what the federate last saw.
    ///
    /// Future events pull the next grant forward. Events at or before the
    /// current time are already readable; if they carry new data they mark
    /// the federate for an `IterateIfNeeded` re-execution instead.
    pub fn note_event(&mut self, time: Time, changed: bool) {
        if time > self.current_time {
            self.event_time = self.event_time.min(time);
        } else if changed {
            self.has_new_data = true;
        }
    }

    /// Reset the pending-event horizon after the owning core drained the
    /// queues up to the grant.
    pub fn set_event_time(&mut self, time: Time) {
        self.event_time = time;
    }

    /// A federate asks to advance to `time`. Callers follow up with
    /// [`TimeCoordinator::check_grant`].
    pub fn request_time(&mut self, time: Time, iterate: IterationRequest) {
        let floor = self.current_time + self.props.time_delta;
        self.requested = time.max(floor);
        self.iteration_request = iterate;
        self.state = TimeState::TimeRequested;
    }

    /// Update the record for one dependency.
    pub fn update_dependency(&mut self, dep: GlobalId, report: TimeReport) {
        if dep == self.id {
            return;
        }
        if let Some(info) = self.dependencies.get_mut(&dep) {
            info.te = report.te;
            info.tdemin = report.tdemin;
            info.granted = report.granted;
            info.iterating = report.iterating;
        }
    }

    /// The earliest time this federate might still produce an event, as seen
    /// by its dependents.
    pub fn report(&self) -> TimeReport {
        let te = match self.state {
            TimeState::Initializing => Time::INITIALIZATION,
            TimeState::TimeGranted => self.current_time + self.props.time_delta,
            TimeState::TimeRequested => {
                if self.iterating() {
                    self.current_time
                } else {
                    self.requested.min(self.event_time)
                }
            }
        };
        TimeReport {
            te: te + self.props.output_delay,
            tdemin: self.props.time_delta,
            granted: self.current_time,
            iterating: self.iterating(),
        }
    }

    fn iterating(&self) -> bool {
        self.iteration_request == IterationRequest::ForceIteration
            || (self.iteration_request == IterationRequest::IterateIfNeeded && self.has_new_data)
    }

    /// Earliest time any dependency might still send us an event.
    fn dependency_bound(&self) -> Time {
        self.dependencies
            .values()
            .map(|info| info.te.max(info.granted) + self.props.input_delay)
            .min()
            .unwrap_or(Time::MAX_TIME)
    }

    /// Snap `time` up to the federate's period grid, if one is set.
    fn align(&self, time: Time) -> Time {
        let period = self.props.period;
        if period <= Time::ZERO || time.is_max() {
            return time;
        }
        let offset = self.props.offset;
        if time <= offset {
            return offset;
        }
        let span = (time - offset).ticks();
        let steps = (span + period.ticks() - 1) / period.ticks();
        offset + Time::from_ticks(steps * period.ticks())
    }

    /// Evaluate whether the outstanding request can be granted.
    pub fn check_grant(&mut self) -> Option<Grant> {
        if self.state != TimeState::TimeRequested {
            return None;
        }

        // Iteration closure: iterate if we asked to, or if any dependency is
        // itself iterating at our current time.
        let dep_iterating = self
            .dependencies
            .values()
            .any(|info| info.iterating && info.granted <= self.current_time);
        if self.iterating() || dep_iterating {
            if self.iterations >= self.props.max_iterations {
                tracing::warn!(
                    federate = %self.id,
                    limit = self.props.max_iterations,
                    "iteration limit reached; converging forcibly"
                );
            } else {
                self.iterations += 1;
                self.state = TimeState::TimeGranted;
                self.has_new_data = false;
                self.iteration_request = IterationRequest::NoIterations;
                return Some(Grant {
                    time: self.current_time,
                    result: IterationResult::Iterating,
                });
            }
        }

        let candidate = self.align(self.requested.min(self.event_time));

        if let Some(barrier) = self.barrier {
            if candidate >= barrier {
                return None;
            }
        }
        if candidate > self.dependency_bound() {
            return None;
        }
        if candidate <= self.current_time {
            return None;
        }

        self.current_time = candidate;
        self.state = TimeState::TimeGranted;
        self.iterations = 0;
        self.has_new_data = false;
        self.iteration_request = IterationRequest::NoIterations;
        if self.event_time <= candidate {
            self.event_time = Time::MAX_TIME;
        }
        Some(Grant {
            time: candidate,
            result: if candidate.is_max() {
                IterationResult::Halted
            } else {
                IterationResult::NextStep
            },
        })
    }

    /// Terminate coordination; any outstanding request resolves as halted.
    pub fn halt(&mut self) -> Option<Grant> {
        let was_requested = self.state == TimeState::TimeRequested;
        self.state = TimeState::TimeGranted;
        was_requested.then_some(Grant {
            time: self.current_time.max(Time::ZERO),
            result: IterationResult::Halted,
        })
    }
}

/// Merge the reports of all federates in a subtree into the single report a
/// core sends upstream.
pub fn aggregate_reports<'a>(reports: impl Iterator<Item = &'a TimeReport>) -> TimeReport {
    let mut agg = TimeReport {
        te: Time::MAX_TIME,
        tdemin: Time::MAX_TIME,
        granted: Time::MAX_TIME,
        iterating: false,
    };
    for report in reports {
        agg.te = agg.te.min(report.te);
        agg.tdemin = agg.tdemin.min(report.tdemin);
        agg.granted = agg.granted.min(report.granted);
        agg.iterating |= report.iterating;
    }
    agg
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fed(n: i32) -> GlobalId {
        GlobalId(weave_core::FEDERATE_ID_SHIFT + n)
    }

    fn exec_coordinator() -> TimeCoordinator {
        let mut tc = TimeCoordinator::new(fed(0), TimeProps::default());
        tc.enter_executing();
        tc
    }

    #[test]
    fn free_running_federate_gets_requested_time() {
        let mut tc = exec_coordinator();
        tc.request_time(Time::from_seconds(1.0), IterationRequest::NoIterations);
        let grant = tc.check_grant().unwrap();
        assert_eq!(grant.time, Time::from_seconds(1.0));
        assert_eq!(grant.result, IterationResult::NextStep);
    }

    #[test]
    fn grants_are_non_decreasing() {
        let mut tc = exec_coordinator();
        let mut last = Time::ZERO;
        for t in [0.5, 1.0, 1.0, 2.5] {
            tc.request_time(Time::from_seconds(t), IterationRequest::NoIterations);
            let grant = tc.check_grant().unwrap();
            assert!(grant.time >= last);
            last = grant.time;
        }
    }

    #[test]
    fn waits_for_dependency_then_grants() {
        let mut tc = exec_coordinator();
        tc.add_dependency(fed(1));
        tc.request_time(Time::from_seconds(1.0), IterationRequest::NoIterations);
        // Dependency still at initialization: no grant.
        assert!(tc.check_grant().is_none());

        tc.update_dependency(
            fed(1),
            TimeReport {
                te: Time::from_seconds(1.0),
                tdemin: Time::EPSILON,
                granted: Time::ZERO,
                iterating: false,
            },
        );
        let grant = tc.check_grant().unwrap();
        assert_eq!(grant.time, Time::from_seconds(1.0));
    }

    #[test]
    fn barrier_blocks_until_cleared() {
        let mut tc = exec_coordinator();
        tc.set_barrier(Time::from_seconds(2.0));

        tc.request_time(Time::from_seconds(1.75), IterationRequest::NoIterations);
        assert_eq!(tc.check_grant().unwrap().time, Time::from_seconds(1.75));

        tc.request_time(Time::from_seconds(3.0), IterationRequest::NoIterations);
        assert!(tc.check_grant().is_none());

        tc.set_barrier(Time::from_seconds(5.0));
        assert_eq!(tc.check_grant().unwrap().time, Time::from_seconds(3.0));
    }

    #[test]
    fn early_event_pulls_the_grant_forward() {
        let mut tc = exec_coordinator();
        tc.note_event(Time::from_seconds(0.5), true);
        tc.request_time(Time::from_seconds(2.0), IterationRequest::NoIterations);
        let grant = tc.check_grant().unwrap();
        assert_eq!(grant.time, Time::from_seconds(0.5));
    }

    #[test]
    fn forced_iteration_stays_at_current_time() {
        let mut tc = exec_coordinator();
        tc.request_time(Time::from_seconds(1.0), IterationRequest::NoIterations);
        tc.check_grant().unwrap();

        tc.request_time(Time::from_seconds(2.0), IterationRequest::ForceIteration);
        let grant = tc.check_grant().unwrap();
        assert_eq!(grant.time, Time::from_seconds(1.0));
        assert_eq!(grant.result, IterationResult::Iterating);
    }

    #[test]
    fn iterate_if_needed_without_new_data_advances() {
        let mut tc = exec_coordinator();
        tc.request_time(Time::from_seconds(1.0), IterationRequest::IterateIfNeeded);
        let grant = tc.check_grant().unwrap();
        assert_eq!(grant.result, IterationResult::NextStep);
    }

    #[test]
    fn iterate_if_needed_with_new_data_iterates_then_converges() {
        let mut tc = exec_coordinator();
        tc.request_time(Time::from_seconds(1.0), IterationRequest::NoIterations);
        tc.check_grant().unwrap();

        tc.note_event(Time::from_seconds(1.0), true);
        tc.request_time(Time::from_seconds(2.0), IterationRequest::IterateIfNeeded);
        let grant = tc.check_grant().unwrap();
        assert_eq!(grant.result, IterationResult::Iterating);
        assert_eq!(grant.time, Time::from_seconds(1.0));

        // No new data in the second round: converged, time advances.
        tc.request_time(Time::from_seconds(2.0), IterationRequest::IterateIfNeeded);
        let grant = tc.check_grant().unwrap();
        assert_eq!(grant.result, IterationResult::NextStep);
        assert_eq!(grant.time, Time::from_seconds(2.0));
    }

    #[test]
    fn period_alignment_snaps_up() {
        let props = TimeProps {
            period: Time::from_seconds(1.0),
            offset: Time::from_seconds(0.25),
            ..Default::default()
        };
        let mut tc = TimeCoordinator::new(fed(0), props);
        tc.enter_executing();
        tc.request_time(Time::from_seconds(1.5), IterationRequest::NoIterations);
        let grant = tc.check_grant().unwrap();
        assert_eq!(grant.time, Time::from_seconds(2.25));
    }

    #[test]
    fn max_time_request_halts() {
        let mut tc = exec_coordinator();
        tc.request_time(Time::MAX_TIME, IterationRequest::NoIterations);
        let grant = tc.check_grant().unwrap();
        assert_eq!(grant.result, IterationResult::Halted);
    }

    #[test]
    fn self_dependency_is_collapsed() {
        let mut tc = exec_coordinator();
        tc.add_dependency(fed(0));
        assert!(!tc.has_dependencies());
    }

    #[test]
    fn aggregation_takes_minima() {
        let a = TimeReport {
            te: Time::from_seconds(1.0),
            tdemin: Time::EPSILON,
            granted: Time::from_seconds(0.5),
            iterating: false,
        };
        let b = TimeReport {
            te: Time::from_seconds(2.0),
            tdemin: Time::from_seconds(0.1),
            granted: Time::from_seconds(1.5),
            iterating: true,
        };
        let agg = aggregate_reports([a, b].iter());
        assert_eq!(agg.te, Time::from_seconds(1.0));
        assert_eq!(agg.granted, Time::from_seconds(0.5));
        assert!(agg.iterating);
    }
}
