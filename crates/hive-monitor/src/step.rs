//! Step results of the orchestration handlers.
//!
//! A handler is an ordered sequence of guarded steps. A step that cannot be
//! satisfied yet returns [`Defer`] with a reason; `?` short-circuits the rest
//! of the handler and the object is looked at again on the next pass.
//!
//! ```text
//! handle_started(view)
//!   ├── thawed?            ──no──▶ Ok(Decision::act(Thaw))
//!   ├── leader?            ──no──▶ Err(Defer("not leader"))
//!   ├── parents available? ──no──▶ Err(Defer("wait parents"))
//!   └── Ok(Decision::act(Start))
//! ```

use std::borrow::Cow;
use std::fmt;

use hive_state::MonitorStatus;

use crate::collaborators::Action;

/// "Not yet": try again on the next pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Defer {
    pub reason: Cow<'static, str>,
    /// Waiting status to publish while deferred, if any.
    pub status: Option<MonitorStatus>,
}

impl Defer {
    pub fn new(reason: impl Into<Cow<'static, str>>) -> Self {
        Self {
            reason: reason.into(),
            status: None,
        }
    }

    /// Publish `status` while waiting.
    pub fn waiting(status: MonitorStatus, reason: impl Into<Cow<'static, str>>) -> Self {
        Self {
            reason: reason.into(),
            status: Some(status),
        }
    }
}

impl fmt::Display for Defer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

/// Outcome of one guarded step sequence.
pub type Step<T = Decision> = Result<T, Defer>;

/// What a handler wants done for its object.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Nothing to do.
    Nothing,
    /// Launch `action` and publish the transitional `status`.
    Act { action: Action, status: MonitorStatus },
    /// Publish a new status without launching anything.
    SetStatus(MonitorStatus),
    /// Drop the global expect.
    ClearGlobalExpect,
}

impl Decision {
    pub fn act(action: Action) -> Self {
        let status = action.transitional_status();
        Decision::Act { action, status }
    }
}

/// Defer unless `cond` holds.
///
/// ```ignore
/// require!(view.is_leader(), "not leader");
/// require!(parents_up, MonitorStatus::WaitParents, "wait parents {}", names);
/// ```
#[macro_export]
macro_rules! require {
    ($cond:expr, $reason:literal) => {
        if !$cond {
            return Err($crate::step::Defer::new($reason));
        }
    };
    ($cond:expr, $status:path, $($fmt:tt)+) => {
        if !$cond {
            return Err($crate::step::Defer::waiting($status, format!($($fmt)+)));
        }
    };
}
