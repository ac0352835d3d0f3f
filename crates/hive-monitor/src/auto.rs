//! Automatic orchestration of objects without a global expect.
//!
//! # Failover
//!
//! ```text
//!            leader, aggregate down, no peer ready or busy
//!   idle ──────────────────────────────────────────────▶ ready
//!    ▲                                                     │
//!    │  up elsewhere, leadership lost, peer ready or busy  │ ready_period
//!    └─────────────────────────────────────────────────────┤ elapsed
//!                                                          ▼
//!                                                      starting
//! ```
//!
//! # Flex
//!
//! Below target, the best-ranked inactive nodes go through the same ready
//! window. Above target, the surplus up instances stop: overloaded nodes
//! first, then the worst ranked.
//!
//! # Restart budget
//!
//! A monitored resource seen down on a started instance is restarted while
//! its retry counter is below budget. The counter resets once the resource
//! is up again. An exhausted monitored resource fails the instance.

use std::cmp::Reverse;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use hive_state::{Avail, LocalExpect, MonitorStatus, NodeName, Orchestrate, Topology};

use crate::collaborators::Action;
use crate::require;
use crate::step::{Decision, Defer, Step};
use crate::view::ObjectView;

/// What the engine remembers about an object between passes.
#[derive(Debug, Clone, Default)]
pub struct ObjectMemory {
    /// When the local smon entered `ready`.
    pub ready_since: Option<Instant>,
    /// The object was started once by this daemon run.
    pub auto_started: bool,
    /// Peers fenced on behalf of this object.
    pub fenced: BTreeSet<NodeName>,
}

pub struct AutoContext<'a> {
    pub memory: &'a ObjectMemory,
    pub now: Instant,
    pub ready_period: Duration,
}

impl AutoContext<'_> {
    fn settled(&self) -> bool {
        self.memory
            .ready_since
            .is_some_and(|since| self.now.saturating_duration_since(since) >= self.ready_period)
    }
}

pub fn handle(view: &ObjectView, ctx: &AutoContext<'_>) -> Step {
    if view.config.orchestrate == Orchestrate::No
        || view.node_frozen
        || view.local_frozen()
        || view.instance.is_none()
        || view.smon.status.is_failed()
    {
        return Ok(Decision::Nothing);
    }
    match view.config.topology {
        Topology::Failover => failover(view, ctx),
        Topology::Flex => flex(view, ctx),
        Topology::Span => Ok(Decision::Nothing),
    }
}

fn failover(view: &ObjectView, ctx: &AutoContext<'_>) -> Step {
    if view.local_up() {
        if view.agg.up.len() > 1 && !view.is_leader() && view.config.orchestrate == Orchestrate::Ha {
            return Ok(Decision::act(Action::Stop { force: false }));
        }
        return Ok(Decision::Nothing);
    }

    if view.smon.status == MonitorStatus::Ready {
        if let Some(reason) = ready_blocker(view) {
            return Err(Defer::waiting(MonitorStatus::Idle, reason));
        }
        if let Some(node) = stonith_target(view, ctx) {
            return Ok(Decision::act(Action::Stonith { node }));
        }
        require!(ctx.settled(), "ready, settling");
        return Ok(Decision::act(Action::Start));
    }

    if !view.agg.is_down() {
        return Ok(Decision::Nothing);
    }
    require!(view.is_leader(), "not leader");
    if view.config.orchestrate == Orchestrate::Start && ctx.memory.auto_started {
        return Ok(Decision::Nothing);
    }
    if let Some(reason) = peers_blocker(view) {
        return Err(Defer::new(reason));
    }
    let parents = view.parents_down();
    require!(parents.is_empty(), MonitorStatus::WaitParents, "wait parents {}", parents.join(","));
    Ok(Decision::SetStatus(MonitorStatus::Ready))
}

/// Why a ready failover leader must fall back to idle.
fn ready_blocker(view: &ObjectView) -> Option<String> {
    if !view.agg.is_down() {
        return Some("instance up elsewhere".into());
    }
    if !view.is_leader() {
        return Some("no longer leader".into());
    }
    if let Some(reason) = peers_blocker(view) {
        return Some(reason);
    }
    let parents = view.parents_down();
    if !parents.is_empty() {
        return Some(format!("parents down: {}", parents.join(",")));
    }
    None
}

fn peers_blocker(view: &ObjectView) -> Option<String> {
    let ready = view.peers_in(MonitorStatus::Ready);
    if !ready.is_empty() {
        return Some(format!("peer ready: {}", ready.join(",")));
    }
    let busy = view.peers_transitioning();
    if !busy.is_empty() {
        return Some(format!("peers transitioning: {}", busy.join(",")));
    }
    None
}

/// A peer that failed its instance and asked to be fenced before takeover.
fn stonith_target(view: &ObjectView, ctx: &AutoContext<'_>) -> Option<NodeName> {
    if !view.config.stonith {
        return None;
    }
    view.peers
        .iter()
        .filter(|(node, peer)| peer.smon.stonith.as_deref() == Some(node.as_str()))
        .map(|(node, _)| node.clone())
        .find(|node| !ctx.memory.fenced.contains(node))
}

fn flex(view: &ObjectView, ctx: &AutoContext<'_>) -> Step {
    let target = view.config.flex_target() as usize;

    if view.local_up() {
        let up = view.agg.up.len();
        if up <= target || view.config.orchestrate != Orchestrate::Ha {
            return Ok(Decision::Nothing);
        }
        let victims = stop_order(view);
        if victims.iter().take(up - target).any(|n| *n == view.local) {
            return Ok(Decision::act(Action::Stop { force: false }));
        }
        return Ok(Decision::Nothing);
    }

    let mut active = view.active_nodes();
    active.remove(&view.local);
    if view.smon.status == MonitorStatus::Ready {
        if active.len() >= target {
            return Err(Defer::waiting(MonitorStatus::Idle, "target reached"));
        }
        require!(ctx.settled(), "ready, settling");
        return Ok(Decision::act(Action::Start));
    }

    if active.len() >= target {
        return Ok(Decision::Nothing);
    }
    require!(view.among_best_inactive(), "not among the best inactive candidates");
    if view.config.orchestrate == Orchestrate::Start && ctx.memory.auto_started {
        return Ok(Decision::Nothing);
    }
    let parents = view.parents_down();
    require!(parents.is_empty(), MonitorStatus::WaitParents, "wait parents {}", parents.join(","));
    Ok(Decision::SetStatus(MonitorStatus::Ready))
}

/// Up nodes in the order they should be stopped.
fn stop_order(view: &ObjectView) -> Vec<NodeName> {
    let mut nodes: Vec<NodeName> = view.agg.up.iter().cloned().collect();
    nodes.sort_by_key(|n| {
        (
            !view.overloaded.contains(n),
            Reverse(view.rank_of(n).unwrap_or(usize::MAX)),
            n.clone(),
        )
    });
    nodes
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartPlan {
    /// Resources back up: drop their retry counters.
    Reset(Vec<String>),
    /// Restart these resources, counting one retry each.
    Restart(Vec<String>),
    /// Monitored resources out of retries: fail the instance.
    Exhausted(Vec<String>),
}

/// Restart bookkeeping for the local instance, if any is due.
pub fn restart_plan(view: &ObjectView, default_budget: u32) -> Option<RestartPlan> {
    let instance = view.instance.as_ref()?;
    if view.config.orchestrate == Orchestrate::No
        || view.smon.local_expect != LocalExpect::Started
        || view.smon.status.is_transitional()
        || view.smon.status.is_failed()
        || view.node_frozen
        || instance.is_frozen()
    {
        return None;
    }

    let reset: Vec<String> = view
        .smon
        .restart
        .iter()
        .filter(|(rid, count)| **count > 0 && instance.resources.get(*rid).is_some_and(|r| r.status.is_up()))
        .map(|(rid, _)| rid.clone())
        .collect();
    if !reset.is_empty() {
        return Some(RestartPlan::Reset(reset));
    }

    let budget = |restart: u32| if restart > 0 { restart } else { default_budget };
    let down: Vec<(&String, u32, bool)> = instance
        .resources
        .iter()
        .filter(|(_, r)| r.status == Avail::Down && !r.optional)
        .filter(|(_, r)| r.monitor || budget(r.restart) > 0)
        .map(|(rid, r)| (rid, budget(r.restart), r.monitor))
        .collect();

    let retry: Vec<String> = down
        .iter()
        .filter(|(rid, budget, _)| view.smon.restart.get(*rid).copied().unwrap_or(0) < *budget)
        .map(|(rid, _, _)| (*rid).clone())
        .collect();
    if !retry.is_empty() {
        return Some(RestartPlan::Restart(retry));
    }
    let exhausted: Vec<String> = down
        .iter()
        .filter(|(_, _, monitor)| *monitor)
        .map(|(rid, _, _)| (*rid).clone())
        .collect();
    if exhausted.is_empty() {
        None
    } else {
        Some(RestartPlan::Exhausted(exhausted))
    }
}
