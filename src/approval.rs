//! Risk policy for shell commands and the approval handshake with the user.
//!
//! The dispatcher thread calls [`ApprovalGate::request`], which posts a
//! [`PendingApproval`] to whoever holds the [`ApprovalInbox`] (the terminal
//! session) and blocks until that side answers or the timeout expires. Nothing
//! is remembered between calls.

use regex::{Regex, RegexBuilder};
use std::fmt;
use std::sync::mpsc;
use std::time::Duration;
use tracing::{info, warn};

// ═══════════════════════════════════════════════════════════════════════════
//  RISK POLICY
// ═══════════════════════════════════════════════════════════════════════════

/// Built-in risk patterns, matched against the lowercased command.
const BUILTIN_PATTERNS: &[(&str, &str)] = &[
    (
        r"(^|[\s;&|(`])(sudo|su|doas|pkexec)(\s|$)",
        "superuser escalation",
    ),
    (
        r"\b(curl|wget|fetch)\b[^|]*\|\s*(sudo\s+)?(sh|bash|zsh|dash|ksh|fish|python[0-9.]*|perl|ruby|node)\b",
        "pipes a remote script into an interpreter",
    ),
    (
        r"\b(mkfs(\.[a-z0-9]+)?|fdisk|sfdisk|parted|wipefs)\b",
        "formats or repartitions a disk",
    ),
    (r"\bdd\b.*\bof=/dev/", "writes raw bytes to a device"),
    (
        r">\s*/dev/(sd|hd|nvme|disk|mmcblk|xvd)",
        "redirects output onto a block device",
    ),
    (
        r":\s*\(\s*\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
        "fork bomb",
    ),
    (
        r"\b(chmod|chown|chgrp)\s+(\S+\s+)*(-[a-z]*r[a-z]*|--recursive)\b",
        "recursive permission or ownership change",
    ),
    (
        r"\b(shutdown|reboot|halt|poweroff)\b",
        "powers off or restarts the machine",
    ),
    (
        r"\bgit\s+push\b.*(\s--force(-with-lease)?\b|\s-f\b|\s\+\S)",
        "force-pushes git history",
    ),
    (
        r"\bgit\s+reset\b.*--hard\b",
        "discards uncommitted git changes",
    ),
    (
        r"\bgit\s+clean\b.*\s-[a-z]*f",
        "deletes untracked files",
    ),
    (r"\bkill\s+-(9|kill|sigkill)\s+-1\b", "kills every process"),
    (r"\bkillall\b", "kills processes by name"),
];

enum RuleMatcher {
    Pattern(Regex),
    Check(fn(&str) -> bool),
}

struct RiskRule {
    matcher: RuleMatcher,
    reason: String,
}

impl RiskRule {
    fn matches(&self, command: &str) -> bool {
        match &self.matcher {
            RuleMatcher::Pattern(regex) => regex.is_match(command),
            RuleMatcher::Check(check) => check(command),
        }
    }
}

/// Decides whether a shell command needs the user's consent.
pub struct RiskPolicy {
    rules: Vec<RiskRule>,
}

impl RiskPolicy {
    /// Built-in rules plus `extra` regexes from the configuration.
    pub fn new(extra: &[String]) -> Result<Self, regex::Error> {
        let mut rules = vec![RiskRule {
            matcher: RuleMatcher::Check(is_forced_recursive_rm),
            reason: "recursive forced delete".to_string(),
        }];
        for (pattern, reason) in BUILTIN_PATTERNS {
            rules.push(RiskRule {
                matcher: RuleMatcher::Pattern(Regex::new(pattern)?),
                reason: (*reason).to_string(),
            });
        }
        for pattern in extra {
            let regex = RegexBuilder::new(pattern).case_insensitive(true).build()?;
            rules.push(RiskRule {
                matcher: RuleMatcher::Pattern(regex),
                reason: format!("matches configured risk pattern `{pattern}`"),
            });
        }
        Ok(Self { rules })
    }

    /// The reason the command is risky, or `None` if it may run unattended.
    pub fn assess(&self, command: &str) -> Option<&str> {
        let lowered = command.to_lowercase();
        self.rules
            .iter()
            .find(|rule| rule.matches(&lowered))
            .map(|rule| rule.reason.as_str())
    }
}

/// `rm` with both a recursive and a force flag, in any order or spelling.
fn is_forced_recursive_rm(command: &str) -> bool {
    command
        .split(|c| matches!(c, ';' | '&' | '|' | '\n' | '(' | ')' | '`'))
        .any(|segment| {
            let mut words = segment.split_whitespace();
            // Skip wrappers like `sudo`/`xargs`/`command` down to the program name.
            let found_rm = words.by_ref().any(|w| w == "rm" || w.ends_with("/rm"));
            if !found_rm {
                return false;
            }
            let (mut recursive, mut force) = (false, false);
            for word in words {
                match word {
                    "--recursive" => recursive = true,
                    "--force" => force = true,
                    "--" => break,
                    flags if flags.starts_with('-') && !flags.starts_with("--") => {
                        recursive |= flags.contains('r');
                        force |= flags.contains('f');
                    }
                    _ => {}
                }
            }
            recursive && force
        })
}

// ═══════════════════════════════════════════════════════════════════════════
//  APPROVAL HANDSHAKE
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalRequest {
    pub call_id: String,
    pub command: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approved,
    Denied,
    TimedOut,
}

impl fmt::Display for ApprovalDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ApprovalDecision::Approved => "approved",
            ApprovalDecision::Denied => "denied",
            ApprovalDecision::TimedOut => "timed out",
        })
    }
}

/// A request waiting for the user. Dropping it without answering counts as a denial.
pub struct PendingApproval {
    pub request: ApprovalRequest,
    reply: mpsc::SyncSender<bool>,
}

impl PendingApproval {
    /// Deliver the decision. Returns false if the requester already gave up.
    pub fn respond(self, approved: bool) -> bool {
        self.reply.send(approved).is_ok()
    }
}

/// The user-facing end of the handshake.
pub struct ApprovalInbox {
    requests: mpsc::Receiver<PendingApproval>,
}

impl ApprovalInbox {
    /// Block until the next request, or `None` once every gate is gone.
    pub fn recv(&self) -> Option<PendingApproval> {
        self.requests.recv().ok()
    }
}

/// The dispatcher end of the handshake.
#[derive(Clone)]
pub struct ApprovalGate {
    requests: mpsc::Sender<PendingApproval>,
    timeout: Duration,
}

/// Create a connected gate and inbox.
pub fn channel(timeout: Duration) -> (ApprovalGate, ApprovalInbox) {
    let (tx, rx) = mpsc::channel();
    (
        ApprovalGate {
            requests: tx,
            timeout,
        },
        ApprovalInbox { requests: rx },
    )
}

impl ApprovalGate {
    /// Post `request` and block until it is answered or times out.
    pub fn request(&self, request: ApprovalRequest) -> ApprovalDecision {
        info!(
            call_id = %request.call_id,
            command = %request.command,
            reason = %request.reason,
            "approval requested"
        );

        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        let call_id = request.call_id.clone();
        if self
            .requests
            .send(PendingApproval {
                request,
                reply: reply_tx,
            })
            .is_err()
        {
            warn!(%call_id, "no approver is listening; denying");
            return ApprovalDecision::Denied;
        }

        let decision = match reply_rx.recv_timeout(self.timeout) {
            Ok(true) => ApprovalDecision::Approved,
            Ok(false) => ApprovalDecision::Denied,
            Err(mpsc::RecvTimeoutError::Timeout) => ApprovalDecision::TimedOut,
            Err(mpsc::RecvTimeoutError::Disconnected) => ApprovalDecision::Denied,
        };
        info!(%call_id, %decision, "approval decided");
        decision
    }
}
