//! Per-tab navigation stack engine.
//!
//! Each tab instance owns a push/pop history of screens, decoupled
//! from any host navigation. The stack always holds at least the root
//! sentinel entry. Stack mutations are sequenced to a transition's
//! midpoint: a requested push/pop starts a directional transition, the
//! mutation applies at `midpoint()`, and `complete()` finishes it and
//! starts the next queued request. Requests arriving while a
//! transition is in flight queue logically, so rapid repeated taps
//! cannot corrupt ordering or skip entries.

use deno_core::{op2, Extension, OpState};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// Reserved root screen name, distinct from any user-defined screen.
pub const ROOT_SCREEN: &str = "__root__";

/// One stack entry: a screen name and the params it was pushed with.
#[derive(Debug, Clone, Serialize)]
pub struct NavEntry {
    pub screen_name: String,
    pub params: Value,
}

/// Visual direction paired with a transition. The animation itself is
/// the UI layer's concern; the direction and ordering are contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavDirection {
    /// New screen enters from the right (push).
    EnterFromRight,
    /// Previous screen enters from the left (pop).
    EnterFromLeft,
}

#[derive(Debug, Clone)]
enum NavOp {
    Push { screen: String, params: Value },
    Pop,
    PopToRoot,
}

impl NavOp {
    fn direction(&self) -> NavDirection {
        match self {
            NavOp::Push { .. } => NavDirection::EnterFromRight,
            NavOp::Pop | NavOp::PopToRoot => NavDirection::EnterFromLeft,
        }
    }
}

#[derive(Debug)]
struct ActiveTransition {
    op: NavOp,
    midpoint_applied: bool,
}

/// The per-tab stack state machine.
#[derive(Debug)]
pub struct NavStack {
    entries: Vec<NavEntry>,
    active: Option<ActiveTransition>,
    queue: VecDeque<NavOp>,
}

impl Default for NavStack {
    fn default() -> Self {
        Self::new()
    }
}

impl NavStack {
    pub fn new() -> Self {
        Self {
            entries: vec![NavEntry {
                screen_name: ROOT_SCREEN.to_string(),
                params: Value::Object(Default::default()),
            }],
            active: None,
            queue: VecDeque::new(),
        }
    }

    /// Request a push. Returns the direction if a transition started
    /// now; `None` means the request was queued behind an in-flight
    /// transition.
    pub fn push(&mut self, screen: impl Into<String>, params: Value) -> Option<NavDirection> {
        self.request(NavOp::Push {
            screen: screen.into(),
            params,
        })
    }

    /// Request a pop. No-op at root.
    pub fn pop(&mut self) -> Option<NavDirection> {
        self.request(NavOp::Pop)
    }

    /// Request truncation to the single root entry. No-op at root.
    pub fn pop_to_root(&mut self) -> Option<NavDirection> {
        self.request(NavOp::PopToRoot)
    }

    fn request(&mut self, op: NavOp) -> Option<NavDirection> {
        if self.active.is_some() {
            self.queue.push_back(op);
            return None;
        }
        self.start(op)
    }

    fn start(&mut self, op: NavOp) -> Option<NavDirection> {
        // Pops against a settled root stack are no-ops, not transitions.
        if matches!(op, NavOp::Pop | NavOp::PopToRoot) && self.entries.len() <= 1 {
            return None;
        }
        let direction = op.direction();
        self.active = Some(ActiveTransition {
            op,
            midpoint_applied: false,
        });
        Some(direction)
    }

    /// Apply the in-flight transition's stack mutation. Called by the
    /// transition driver at the animation midpoint, so the visible
    /// screen and the logical top-of-stack never stay inconsistent.
    pub fn midpoint(&mut self) {
        if let Some(active) = self.active.as_mut() {
            if !active.midpoint_applied {
                apply(&mut self.entries, &active.op);
                active.midpoint_applied = true;
            }
        }
    }

    /// Finish the in-flight transition and start the next queued one,
    /// returning its direction if one started. The mutation is applied
    /// here if the driver never reported a midpoint.
    pub fn complete(&mut self) -> Option<NavDirection> {
        if let Some(mut active) = self.active.take() {
            if !active.midpoint_applied {
                apply(&mut self.entries, &active.op);
                active.midpoint_applied = true;
            }
        }
        while let Some(op) = self.queue.pop_front() {
            if let Some(direction) = self.start(op) {
                return Some(direction);
            }
        }
        None
    }

    /// Drive all in-flight and queued transitions to rest.
    pub fn settle(&mut self) {
        while self.active.is_some() {
            self.midpoint();
            self.complete();
        }
    }

    /// Params of the top-of-stack entry.
    pub fn params(&self) -> &Value {
        &self.entries.last().expect("stack never empty").params
    }

    /// Screen name of the top-of-stack entry.
    pub fn current_screen(&self) -> &str {
        &self.entries.last().expect("stack never empty").screen_name
    }

    pub fn depth(&self) -> usize {
        self.entries.len()
    }

    pub fn is_at_root(&self) -> bool {
        self.entries.len() == 1
    }

    pub fn in_flight(&self) -> bool {
        self.active.is_some()
    }

    pub fn entries(&self) -> &[NavEntry] {
        &self.entries
    }
}

fn apply(entries: &mut Vec<NavEntry>, op: &NavOp) {
    match op {
        NavOp::Push { screen, params } => entries.push(NavEntry {
            screen_name: screen.clone(),
            params: params.clone(),
        }),
        NavOp::Pop => {
            if entries.len() > 1 {
                entries.pop();
            }
        }
        NavOp::PopToRoot => entries.truncate(1),
    }
}

// ============================================================================
// Tab registry + ops
// ============================================================================

/// All live tab-instance stacks for one extension runtime.
#[derive(Default)]
pub struct NavRegistry {
    pub stacks: HashMap<String, NavStack>,
}

impl NavRegistry {
    pub fn ensure(&mut self, tab: &str) -> &mut NavStack {
        self.stacks.entry(tab.to_string()).or_default()
    }

    pub fn get(&self, tab: &str) -> Option<&NavStack> {
        self.stacks.get(tab)
    }

    pub fn get_mut(&mut self, tab: &str) -> Option<&mut NavStack> {
        self.stacks.get_mut(tab)
    }
}

fn registry(state: &mut OpState) -> &mut NavRegistry {
    if state.try_borrow::<NavRegistry>().is_none() {
        state.put(NavRegistry::default());
    }
    state.borrow_mut::<NavRegistry>()
}

#[op2]
fn op_nav_push(
    state: &mut OpState,
    #[string] tab: String,
    #[string] screen: String,
    #[serde] params: Option<Value>,
) {
    debug!(tab = %tab, screen = %screen, "nav.push");
    registry(state)
        .ensure(&tab)
        .push(screen, params.unwrap_or(Value::Object(Default::default())));
}

#[op2(fast)]
fn op_nav_pop(state: &mut OpState, #[string] tab: &str) {
    debug!(tab = %tab, "nav.pop");
    registry(state).ensure(tab).pop();
}

#[op2(fast)]
fn op_nav_pop_to_root(state: &mut OpState, #[string] tab: &str) {
    debug!(tab = %tab, "nav.popToRoot");
    registry(state).ensure(tab).pop_to_root();
}

#[op2]
#[serde]
fn op_nav_params(state: &mut OpState, #[string] tab: String) -> Value {
    registry(state).ensure(&tab).params().clone()
}

#[op2]
#[string]
fn op_nav_screen(state: &mut OpState, #[string] tab: String) -> String {
    registry(state).ensure(&tab).current_screen().to_string()
}

/// Install an empty tab registry into op state.
pub fn init_nav_state(state: &mut OpState) {
    state.put(NavRegistry::default());
}

deno_core::extension!(
    lhub_nav,
    ops = [
        op_nav_push,
        op_nav_pop,
        op_nav_pop_to_root,
        op_nav_params,
        op_nav_screen,
    ]
);

pub fn nav_extension() -> Extension {
    lhub_nav::ext()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn root_sentinel_is_always_present() {
        let stack = NavStack::new();
        assert_eq!(stack.depth(), 1);
        assert_eq!(stack.current_screen(), ROOT_SCREEN);
        assert!(stack.is_at_root());
    }

    #[test]
    fn push_then_pop_restores_pre_push_state() {
        let mut stack = NavStack::new();
        stack.push("a", json!({"x": 1}));
        stack.settle();
        assert_eq!(stack.current_screen(), "a");
        assert_eq!(stack.params(), &json!({"x": 1}));

        stack.pop();
        stack.settle();
        assert_eq!(stack.depth(), 1);
        assert_eq!(stack.current_screen(), ROOT_SCREEN);
        assert_eq!(stack.params(), &json!({}));
    }

    #[test]
    fn pop_at_root_is_a_noop() {
        let mut stack = NavStack::new();
        assert!(stack.pop().is_none());
        stack.settle();
        assert_eq!(stack.depth(), 1);
        assert!(stack.pop_to_root().is_none());
    }

    #[test]
    fn mutation_waits_for_midpoint() {
        let mut stack = NavStack::new();
        let dir = stack.push("detail", json!({"id": 7}));
        assert_eq!(dir, Some(NavDirection::EnterFromRight));

        // Transition started but midpoint not reached: logical top is
        // still the root.
        assert_eq!(stack.current_screen(), ROOT_SCREEN);

        stack.midpoint();
        assert_eq!(stack.current_screen(), "detail");
        assert_eq!(stack.params(), &json!({"id": 7}));

        stack.complete();
        assert!(!stack.in_flight());
    }

    #[test]
    fn requests_mid_flight_queue_in_order() {
        let mut stack = NavStack::new();
        stack.push("a", json!({}));
        // Three rapid taps while the first transition is in flight.
        assert!(stack.push("b", json!({})).is_none());
        assert!(stack.push("c", json!({})).is_none());
        assert!(stack.pop().is_none());

        stack.settle();
        // a, b, c pushed in order, then one pop: top is b.
        assert_eq!(stack.current_screen(), "b");
        assert_eq!(stack.depth(), 3);
    }

    #[test]
    fn pop_directions_enter_from_left() {
        let mut stack = NavStack::new();
        stack.push("a", json!({}));
        stack.settle();
        assert_eq!(stack.pop(), Some(NavDirection::EnterFromLeft));
        stack.settle();
    }

    #[test]
    fn pop_to_root_truncates_everything() {
        let mut stack = NavStack::new();
        for name in ["a", "b", "c"] {
            stack.push(name, json!({}));
            stack.settle();
        }
        assert_eq!(stack.depth(), 4);
        stack.pop_to_root();
        stack.settle();
        assert_eq!(stack.depth(), 1);
        assert_eq!(stack.current_screen(), ROOT_SCREEN);
    }

    #[test]
    fn complete_applies_mutation_if_midpoint_was_skipped() {
        let mut stack = NavStack::new();
        stack.push("a", json!({}));
        stack.complete();
        assert_eq!(stack.current_screen(), "a");
    }

    #[test]
    fn unknown_screen_names_are_still_recorded() {
        // Falling back to a placeholder is the renderer's job; the
        // stack records the entry so a later pop behaves normally.
        let mut stack = NavStack::new();
        stack.push("doesNotExist", json!({}));
        stack.settle();
        assert_eq!(stack.current_screen(), "doesNotExist");
        stack.pop();
        stack.settle();
        assert!(stack.is_at_root());
    }
}
