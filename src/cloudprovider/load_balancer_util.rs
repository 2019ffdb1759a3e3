//! Change planning between observed and desired load balancer state

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::oci::types::{Backend, BackendSet, Listener};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionType {
    Create,
    Update,
    Delete,
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionType::Create => "create",
            ActionType::Update => "update",
            ActionType::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// One cloud mutation. Deletes carry the observed object, creates and
/// updates carry the desired one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    BackendSet {
        action_type: ActionType,
        backend_set: BackendSet,
    },
    Listener {
        action_type: ActionType,
        listener: Listener,
    },
}

impl Action {
    pub fn action_type(&self) -> ActionType {
        match self {
            Action::BackendSet { action_type, .. } | Action::Listener { action_type, .. } => {
                *action_type
            }
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Action::BackendSet { backend_set, .. } => &backend_set.name,
            Action::Listener { listener, .. } => &listener.name,
        }
    }

    /// The backend set this action creates, changes, removes or points at.
    pub fn backend_set_name(&self) -> &str {
        match self {
            Action::BackendSet { backend_set, .. } => &backend_set.name,
            Action::Listener { listener, .. } => &listener.default_backend_set_name,
        }
    }

    pub fn is_listener(&self) -> bool {
        matches!(self, Action::Listener { .. })
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::BackendSet { action_type, backend_set } => write!(
                f,
                "BackendSetAction{{name: {}, type: {}}}",
                backend_set.name, action_type
            ),
            Action::Listener { action_type, listener } => write!(
                f,
                "ListenerAction{{name: {}, type: {}}}",
                listener.name, action_type
            ),
        }
    }
}

fn backend_membership(backends: &[Backend]) -> BTreeSet<(String, u16)> {
    backends
        .iter()
        .map(|b| (b.ip_address.clone(), b.port))
        .collect()
}

/// Backends compare as a set of `(ip, port)`. Weights are not compared.
pub fn has_backend_set_changed(actual: &BackendSet, desired: &BackendSet) -> bool {
    actual.health_checker != desired.health_checker
        || actual.policy != desired.policy
        || backend_membership(&actual.backends) != backend_membership(&desired.backends)
}

/// Field-wise equality. An idle timeout left unset on the desired side is the
/// cloud's to choose and does not count as a change.
pub fn has_listener_changed(actual: &Listener, desired: &Listener) -> bool {
    if actual.default_backend_set_name != desired.default_backend_set_name
        || actual.port != desired.port
        || actual.protocol != desired.protocol
        || actual.ssl_configuration != desired.ssl_configuration
    {
        return true;
    }
    desired.connection_configuration.is_some()
        && actual.connection_configuration != desired.connection_configuration
}

fn get_changes<T: Clone>(
    actual: &BTreeMap<String, T>,
    desired: &BTreeMap<String, T>,
    changed: impl Fn(&T, &T) -> bool,
    wrap: impl Fn(ActionType, T) -> Action,
) -> Vec<Action> {
    let mut actions = Vec::new();
    for (name, current) in actual {
        match desired.get(name) {
            None => actions.push(wrap(ActionType::Delete, current.clone())),
            Some(wanted) if changed(current, wanted) => {
                actions.push(wrap(ActionType::Update, wanted.clone()))
            }
            Some(_) => {}
        }
    }
    for (name, wanted) in desired {
        if !actual.contains_key(name) {
            actions.push(wrap(ActionType::Create, wanted.clone()));
        }
    }
    actions
}

pub fn get_backend_set_changes(
    actual: &BTreeMap<String, BackendSet>,
    desired: &BTreeMap<String, BackendSet>,
) -> Vec<Action> {
    get_changes(actual, desired, has_backend_set_changed, |action_type, backend_set| {
        Action::BackendSet {
            action_type,
            backend_set,
        }
    })
}

pub fn get_listener_changes(
    actual: &BTreeMap<String, Listener>,
    desired: &BTreeMap<String, Listener>,
) -> Vec<Action> {
    get_changes(actual, desired, has_listener_changed, |action_type, listener| {
        Action::Listener {
            action_type,
            listener,
        }
    })
}

/// Execution phase of an action; lower runs first.
///
/// Listener deletes release their backend sets, backend sets are then
/// created or updated, listeners that reference them follow, and backend
/// sets that nothing references any more go last.
fn phase(action: &Action) -> u8 {
    match (action.is_listener(), action.action_type()) {
        (true, ActionType::Delete) => 0,
        (false, ActionType::Create | ActionType::Update) => 1,
        (true, ActionType::Create | ActionType::Update) => 2,
        (false, ActionType::Delete) => 3,
    }
}

/// Merge backend set and listener actions into one executable sequence.
pub fn sort_and_combine_actions(
    backend_set_actions: Vec<Action>,
    listener_actions: Vec<Action>,
) -> Vec<Action> {
    let mut actions: Vec<Action> = backend_set_actions
        .into_iter()
        .chain(listener_actions)
        .collect();
    actions.sort_by(|a, b| {
        phase(a)
            .cmp(&phase(b))
            .then_with(|| a.backend_set_name().cmp(b.backend_set_name()))
            .then_with(|| a.name().cmp(b.name()))
    });
    actions
}

/// Node port of a backend set. `None` when it has no backends, in which case
/// no backend security rules are managed for it.
pub fn get_backend_port(backends: &[Backend]) -> Option<u16> {
    backends.first().map(|b| b.port)
}
