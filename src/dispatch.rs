//! Per-call state machine from a raw [`ToolCall`] to exactly one [`ToolResult`].
//!
//! ```text
//! Idle -> Validating -> (AwaitingApproval ->) Executing -> Completed | Failed
//! ```
//!
//! Validation failures, unknown tools and sandbox violations end in `Failed`
//! before anything touches the filesystem. A denied or timed-out approval ends
//! in `Completed` with a denied status and no side effects.

use crate::approval::{ApprovalDecision, ApprovalGate, ApprovalRequest, RiskPolicy};
use crate::conversation::{ToolCall, ToolResult, ToolStatus};
use crate::sandbox::Workspace;
use crate::tools::{self, ToolError, ToolLimits, ToolName, ToolRequest};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    Validating,
    AwaitingApproval,
    Executing,
    Completed,
    Failed,
}

impl DispatchState {
    pub fn is_terminal(self) -> bool {
        matches!(self, DispatchState::Completed | DispatchState::Failed)
    }
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DispatchState::Idle => "idle",
            DispatchState::Validating => "validating",
            DispatchState::AwaitingApproval => "awaiting-approval",
            DispatchState::Executing => "executing",
            DispatchState::Completed => "completed",
            DispatchState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// The result of one dispatch plus the states it went through.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub result: ToolResult,
    pub states: Vec<DispatchState>,
}

impl Dispatch {
    pub fn final_state(&self) -> DispatchState {
        self.states.last().copied().unwrap_or(DispatchState::Idle)
    }
}

struct Trace<'a> {
    call: &'a ToolCall,
    states: Vec<DispatchState>,
}

impl<'a> Trace<'a> {
    fn new(call: &'a ToolCall) -> Self {
        debug!(call_id = %call.id, tool = %call.name, state = %DispatchState::Idle, "dispatch");
        Self {
            call,
            states: vec![DispatchState::Idle],
        }
    }

    fn enter(&mut self, state: DispatchState) {
        debug!(call_id = %self.call.id, tool = %self.call.name, %state, "dispatch");
        self.states.push(state);
    }

    fn finish(mut self, result: ToolResult) -> Dispatch {
        let state = match result.status {
            ToolStatus::Error => DispatchState::Failed,
            _ => DispatchState::Completed,
        };
        self.enter(state);
        Dispatch {
            result,
            states: self.states,
        }
    }
}

/// Routes tool calls to their handlers under the sandbox and approval policy.
#[derive(Clone)]
pub struct Dispatcher {
    workspace: Arc<Workspace>,
    limits: ToolLimits,
    risk: Arc<RiskPolicy>,
    gate: ApprovalGate,
}

impl Dispatcher {
    pub fn new(
        workspace: Arc<Workspace>,
        limits: ToolLimits,
        risk: Arc<RiskPolicy>,
        gate: ApprovalGate,
    ) -> Self {
        Self {
            workspace,
            limits,
            risk,
            gate,
        }
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Drive one call to a terminal state. Blocks while waiting for approval
    /// and while the tool runs.
    pub fn dispatch(&self, call: &ToolCall) -> Dispatch {
        let mut trace = Trace::new(call);
        trace.enter(DispatchState::Validating);

        let request = match self.validate(call) {
            Ok(request) => request,
            Err(err) => {
                if let ToolError::Sandbox(ref e) = err {
                    if e.is_violation() {
                        warn!(call_id = %call.id, tool = %call.name, "sandbox violation: {e}");
                    }
                }
                return trace.finish(ToolResult::error(&call.id, err.to_string()));
            }
        };

        if let ToolRequest::Bash { command, .. } = &request {
            if let Some(reason) = self.risk.assess(command) {
                trace.enter(DispatchState::AwaitingApproval);
                let decision = self.gate.request(ApprovalRequest {
                    call_id: call.id.clone(),
                    command: command.clone(),
                    reason: reason.to_string(),
                });
                match decision {
                    ApprovalDecision::Approved => {}
                    ApprovalDecision::Denied => {
                        return trace.finish(ToolResult::denied(
                            &call.id,
                            format!("The user denied this command ({reason}). It was not run."),
                        ));
                    }
                    ApprovalDecision::TimedOut => {
                        return trace.finish(ToolResult::denied(
                            &call.id,
                            format!(
                                "No approval was given in time for this command ({reason}). \
                                 It was not run."
                            ),
                        ));
                    }
                }
            }
        }

        trace.enter(DispatchState::Executing);
        let result = match tools::execute(&request, &self.workspace, &self.limits) {
            Ok(output) => {
                ToolResult::success(&call.id, output.content).with_truncated(output.truncated)
            }
            Err(err) => ToolResult::error(&call.id, err.to_string()),
        };
        trace.finish(result)
    }

    fn validate(&self, call: &ToolCall) -> Result<ToolRequest, ToolError> {
        let name =
            ToolName::lookup(&call.name).ok_or_else(|| ToolError::UnknownTool(call.name.clone()))?;
        ToolRequest::parse(name, &call.arguments, &self.workspace, &self.limits)
    }
}
