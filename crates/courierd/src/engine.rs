//! Dispatch engine.
//!
//! Runs a resolved unit N times against one target over a session's live
//! connection. Guard failures reject the call before anything is sent;
//! per-iteration transport failures are contained and counted; a dead
//! session aborts the loop.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use courier_core::{
    DispatchError, DispatchOutcome, DispatchRequest, IterationSpec, SessionId, Target,
};

use crate::activity::ActivityLog;
use crate::config::EngineConfig;
use crate::lock::KeyedMutex;
use crate::session::RegistryHandle;
use crate::units::UnitRegistry;

const ACTIVITY_SOURCE: &str = "engine";

/// Progress of a single dispatch call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Validating,
    Rejected,
    Resolving,
    Running(u32),
    Completed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validating => write!(f, "validating"),
            Self::Rejected => write!(f, "rejected"),
            Self::Resolving => write!(f, "resolving"),
            Self::Running(i) => write!(f, "running({i})"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

/// Executes dispatch requests.
pub struct DispatchEngine {
    registry: RegistryHandle,
    units: Arc<UnitRegistry>,
    locks: KeyedMutex<(SessionId, Target)>,
    config: EngineConfig,
    activity: ActivityLog,
}

impl fmt::Debug for DispatchEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchEngine")
            .field("config", &self.config)
            .field("locks", &self.locks)
            .finish_non_exhaustive()
    }
}

impl DispatchEngine {
    pub fn new(
        registry: RegistryHandle,
        units: Arc<UnitRegistry>,
        config: EngineConfig,
        activity: ActivityLog,
    ) -> Self {
        Self {
            registry,
            units,
            locks: KeyedMutex::new(),
            config,
            activity,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Number of (session, target) locks currently held or awaited.
    pub fn active_locks(&self) -> usize {
        self.locks.len()
    }

    /// Runs one dispatch call to completion.
    ///
    /// Never returns an error: every failure is folded into the outcome.
    pub async fn dispatch(&self, request: DispatchRequest) -> DispatchOutcome {
        let session_id = &request.session_id;
        trace_phase(session_id, Phase::Validating);

        let target = match Target::normalize(&request.target, &self.config.direct_suffix) {
            Ok(target) => target,
            Err(e) => return self.reject(session_id, DispatchError::engine_fault(e.to_string())),
        };

        let Some(connection) = self.registry.get_connection(session_id).await else {
            return self.reject(
                session_id,
                DispatchError::engine_fault(format!(
                    "no connection for session {session_id}; reconnect first"
                )),
            );
        };

        if connection.authenticated_identity().is_none() {
            return self.reject(
                session_id,
                DispatchError::engine_fault(format!(
                    "session {session_id} is not authenticated; reconnect first"
                )),
            );
        }

        trace_phase(session_id, Phase::Resolving);
        let Some(unit) = self.units.resolve(&request.unit).await else {
            return self.reject(
                session_id,
                DispatchError::UnitNotFound {
                    name: request.unit.clone(),
                },
            );
        };

        let iterations =
            IterationSpec::coerce(request.iterations.as_ref(), self.config.default_iterations);
        if let Some(max) = self.config.max_iterations.filter(|max| iterations > *max) {
            return self.reject(
                session_id,
                DispatchError::engine_fault(format!(
                    "{iterations} iterations requested; this daemon allows at most {max}"
                )),
            );
        }

        info!(
            session_id = %session_id,
            unit = %unit.name,
            version = %unit.version,
            integrity_tag = %unit.integrity_tag,
            target = %target,
            iterations,
            "Dispatching unit"
        );
        self.activity.info(
            ACTIVITY_SOURCE,
            format!(
                "{session_id}: {} x{iterations} -> {target} ({} / {})",
                unit.name, unit.version, unit.integrity_tag
            ),
        );

        let serialize = unit.unit.serialize_per_target();
        let key = (session_id.clone(), target.clone());
        let pacing = self.config.pacing();
        let mut completed = 0;
        let mut failed = 0;

        for iteration in 1..=iterations {
            if iteration > 1 && !pacing.is_zero() {
                tokio::time::sleep(pacing).await;
            }
            trace_phase(session_id, Phase::Running(iteration));

            let execution = unit.unit.execute(connection.as_ref(), &target);
            let result = if serialize {
                self.locks.with_lock(key.clone(), execution).await
            } else {
                execution.await
            };

            let Err(e) = result else {
                completed += 1;
                continue;
            };

            failed += 1;
            let failure = DispatchError::TransportFailure {
                reason: e.to_string(),
            };
            warn!(
                session_id = %session_id,
                unit = %unit.name,
                target = %target,
                iteration,
                error = %e,
                "Iteration failed"
            );
            self.activity.warn(
                ACTIVITY_SOURCE,
                format!("{session_id}: iteration {iteration}/{iterations} failed: {failure}"),
            );

            if e.is_session_fatal() || !connection.is_open() {
                let death = DispatchError::session_death(e.to_string());
                warn!(
                    session_id = %session_id,
                    completed,
                    failed,
                    "Session died during dispatch"
                );
                self.activity.error(
                    ACTIVITY_SOURCE,
                    format!("{session_id}: dispatch aborted after {iteration} iterations: {death}"),
                );
                return DispatchOutcome::aborted(target, death, completed, failed);
            }
        }

        trace_phase(session_id, Phase::Completed);
        info!(
            session_id = %session_id,
            unit = %unit.name,
            target = %target,
            completed,
            failed,
            "Dispatch finished"
        );
        self.activity.info(
            ACTIVITY_SOURCE,
            format!("{session_id}: {} finished ({completed} ok, {failed} failed)", unit.name),
        );

        DispatchOutcome::finished(target, completed, failed)
    }

    fn reject(&self, session_id: &SessionId, error: DispatchError) -> DispatchOutcome {
        trace_phase(session_id, Phase::Rejected);
        warn!(session_id = %session_id, error = %error, "Dispatch rejected");
        self.activity
            .warn(ACTIVITY_SOURCE, format!("{session_id}: rejected: {error}"));
        DispatchOutcome::rejected(error)
    }
}

fn trace_phase(session_id: &SessionId, phase: Phase) {
    debug!(session_id = %session_id, phase = %phase, "Dispatch phase");
}
