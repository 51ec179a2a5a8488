//! 调度器
//!
//! Drives one pipeline per target: build → flash → connect → run every
//! applicable test case → close. Targets run concurrently on a bounded pool of
//! scoped worker threads; inside a target everything is sequential.
//!
//! Nothing that goes wrong inside one pipeline escapes it. Provisioning and
//! connection faults turn the target's remaining cases into skips, a session
//! fault during a case triggers a reconnect before the next one, and a
//! panicking harness is caught and recorded as a failure.

use log::{debug, error, info, warn};
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Instant;

use crate::aggregator::{Aggregator, FailureKind, RunSummary, TestResult};
use crate::config::target_config::TargetConfig;
use crate::connection::{Connector, PortRegistry};
use crate::harness::{Dut, HarnessError, TestCase};
use crate::provisioner::Provisioner;
use crate::reporter::ReportSink;
use crate::session::{Session, SessionError, SessionOptions};

/// Where a target's pipeline currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetPhase {
    Pending,
    Building,
    Flashing,
    Connecting,
    Running,
    Done,
}

impl fmt::Display for TargetPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TargetPhase::Pending => "pending",
            TargetPhase::Building => "building",
            TargetPhase::Flashing => "flashing",
            TargetPhase::Connecting => "connecting",
            TargetPhase::Running => "running",
            TargetPhase::Done => "done",
        };
        f.write_str(s)
    }
}

pub struct Scheduler {
    targets: Vec<Arc<TargetConfig>>,
    tests: Vec<TestCase>,
    provisioner: Provisioner,
    connector: Arc<dyn Connector>,
    ports: PortRegistry,
    jobs: usize,
    sinks: Vec<Box<dyn ReportSink>>,
}

impl Scheduler {
    /// `jobs` bounds how many targets run at once; 0 means one worker per target.
    pub fn new(
        targets: Vec<TargetConfig>,
        tests: Vec<TestCase>,
        provisioner: Provisioner,
        connector: Arc<dyn Connector>,
        jobs: usize,
    ) -> Self {
        Self {
            targets: targets.into_iter().map(Arc::new).collect(),
            tests,
            provisioner,
            connector,
            ports: PortRegistry::new(),
            jobs,
            sinks: Vec::new(),
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn ReportSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Share port claims with sessions opened outside this scheduler.
    pub fn with_port_registry(mut self, ports: PortRegistry) -> Self {
        self.ports = ports;
        self
    }

    /// Runs every target to completion and returns the summary.
    pub fn run(&self) -> RunSummary {
        let queue: Mutex<VecDeque<Arc<TargetConfig>>> =
            Mutex::new(self.targets.iter().cloned().collect());
        let aggregator = Mutex::new(Aggregator::new());
        let workers = match self.jobs {
            0 => self.targets.len(),
            n => n.min(self.targets.len()),
        };
        info!(
            "Running {} test case(s) on {} target(s) with {workers} worker(s)",
            self.tests.len(),
            self.targets.len()
        );
        for target in &self.targets {
            self.phase(target, TargetPhase::Pending);
        }

        thread::scope(|scope| {
            for worker in 0..workers {
                let queue = &queue;
                let aggregator = &aggregator;
                scope.spawn(move || {
                    loop {
                        let next = queue.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
                        let Some(target) = next else { break };
                        debug!("Worker {worker} picked up {}", target.name);
                        self.run_target(&target, aggregator);
                    }
                });
            }
        });

        let summary = aggregator
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .summary();
        for sink in &self.sinks {
            if let Err(e) = sink.on_summary(&summary) {
                error!("Failed to write report: {e:#}");
            }
        }
        summary
    }

    /// Runs a whole pipeline; a panic anywhere in it skips what is left.
    fn run_target(&self, target: &TargetConfig, aggregator: &Mutex<Aggregator>) {
        let cases: Vec<&TestCase> = self.tests.iter().filter(|c| c.applies_to(target)).collect();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.pipeline(target, &cases, aggregator)
        }));
        if let Err(payload) = outcome {
            let reason = format!("target pipeline panicked: {}", panic_message(&*payload));
            error!("[{}] {reason}", target.name);
            let remaining: Vec<&TestCase> = {
                let agg = aggregator.lock().unwrap_or_else(PoisonError::into_inner);
                cases
                    .iter()
                    .copied()
                    .filter(|c| !agg.has_result(&target.name, &c.name))
                    .collect()
            };
            self.skip_all(target, &remaining, &reason, aggregator);
        }
        self.phase(target, TargetPhase::Done);
    }

    fn pipeline(&self, target: &TargetConfig, cases: &[&TestCase], aggregator: &Mutex<Aggregator>) {
        if cases.is_empty() {
            info!("[{}] No applicable test cases", target.name);
            return;
        }

        self.phase(target, TargetPhase::Building);
        let image = self.provisioner.build(target);

        self.phase(target, TargetPhase::Flashing);
        if let Err(e) = self.provisioner.flash(target, image) {
            self.skip_all(target, cases, &e.to_string(), aggregator);
            return;
        }

        self.phase(target, TargetPhase::Connecting);
        let mut session = match self.connect(target, false) {
            Ok(session) => session,
            Err(e) => {
                error!("[{}] Unable to open a shell session: {e}", target.name);
                self.skip_all(target, cases, &e.to_string(), aggregator);
                return;
            }
        };

        self.phase(target, TargetPhase::Running);
        for (index, case) in cases.iter().enumerate() {
            if !session.is_open() {
                session.close();
                match self.reconnect(target) {
                    Ok(fresh) => session = fresh,
                    Err(e) => {
                        error!("[{}] Reconnect failed: {e}", target.name);
                        let reason = format!("session lost and reconnect failed: {e}");
                        self.skip_all(target, &cases[index..], &reason, aggregator);
                        return;
                    }
                }
            }
            let result = self.run_case(&mut session, target, case);
            self.record(aggregator, result);
        }
        session.close();
    }

    fn run_case(&self, session: &mut Session, target: &TargetConfig, case: &TestCase) -> TestResult {
        info!("[{}] Running {}", target.name, case.name);
        let started = Instant::now();
        let command_timeout = case.command_timeout_for(target);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut dut = Dut::new(session, target, command_timeout, case.timeout);
            case.harness.run(&mut dut)
        }));
        let elapsed = started.elapsed();
        match outcome {
            Ok(Ok(())) => TestResult::passed(&target.name, &case.name, elapsed),
            Ok(Err(HarnessError::Mismatch(failure))) => TestResult::failed(
                &target.name,
                &case.name,
                FailureKind::Assertion,
                failure.to_string(),
                elapsed,
            ),
            Ok(Err(HarnessError::Skip(reason))) => {
                TestResult::skipped(&target.name, &case.name, reason)
            }
            Ok(Err(HarnessError::Session(e))) => {
                warn!("[{}] {} hit a session fault: {e}", target.name, case.name);
                TestResult::failed(
                    &target.name,
                    &case.name,
                    FailureKind::Infrastructure,
                    e.to_string(),
                    elapsed,
                )
            }
            Err(payload) => {
                let message = format!("harness panicked: {}", panic_message(&*payload));
                error!("[{}] {} {message}", target.name, case.name);
                // The shell may be mid-command; start the next case on a fresh session
                session.close();
                TestResult::failed(
                    &target.name,
                    &case.name,
                    FailureKind::Infrastructure,
                    message,
                    elapsed,
                )
            }
        }
    }

    fn connect(&self, target: &TargetConfig, interrupt: bool) -> Result<Session, SessionError> {
        let guard = self.ports.acquire(target.port())?;
        let transport = self.connector.connect(&target.serial)?;
        let options = SessionOptions::from(&target.executor);
        if interrupt {
            Session::reconnect(guard, transport, options)
        } else {
            Session::open(guard, transport, options)
        }
    }

    fn reconnect(&self, target: &TargetConfig) -> Result<Session, SessionError> {
        let retry = &target.retry;
        let mut last = SessionError::Closed(target.port().to_string());
        for attempt in 1..=retry.reconnect_attempts {
            warn!(
                "[{}] Reconnecting (attempt {attempt}/{}) after {:?}",
                target.name, retry.reconnect_attempts, retry.reconnect_backoff
            );
            thread::sleep(retry.reconnect_backoff);
            match self.connect(target, true) {
                Ok(session) => return Ok(session),
                Err(e) => {
                    warn!("[{}] Reconnect attempt {attempt} failed: {e}", target.name);
                    last = e;
                }
            }
        }
        Err(last)
    }

    fn skip_all(
        &self,
        target: &TargetConfig,
        cases: &[&TestCase],
        reason: &str,
        aggregator: &Mutex<Aggregator>,
    ) {
        for case in cases {
            self.record(aggregator, TestResult::skipped(&target.name, &case.name, reason));
        }
    }

    fn record(&self, aggregator: &Mutex<Aggregator>, result: TestResult) {
        let mut agg = aggregator.lock().unwrap_or_else(PoisonError::into_inner);
        for sink in &self.sinks {
            sink.on_result(&result);
        }
        agg.record(result);
    }

    fn phase(&self, target: &TargetConfig, phase: TargetPhase) {
        debug!("[{}] -> {phase}", target.name);
        for sink in &self.sinks {
            sink.on_target_phase(&target.name, phase);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
