use std::sync::Arc;

use crate::id_set::{DeleteSet, IdSet};
use crate::state_vector::StateVector;

/// Summary of one committed transaction.
#[derive(Clone, Debug, PartialEq)]
pub struct TransactionEvent {
    /// Tag passed by the caller, e.g. the peer an update came from.
    pub origin: Option<Arc<str>>,
    pub before_state: StateVector,
    pub after_state: StateVector,
    /// Ids integrated by this transaction.
    pub added: IdSet,
    /// Ids deleted by this transaction.
    pub deleted: DeleteSet,
}

/// Encoded diff of one committed transaction, ready to broadcast.
#[derive(Clone, Debug, PartialEq)]
pub struct UpdateEvent {
    pub origin: Option<Arc<str>>,
    pub update: Vec<u8>,
}

/// Handle returned by the `observe`/`on_update` family; pass it to `unobserve`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

type ChangeListener = Box<dyn FnMut(&TransactionEvent) + Send>;
type UpdateListener = Box<dyn FnMut(&UpdateEvent) + Send>;

/// Listener lists, invoked synchronously once per commit.
#[derive(Default)]
pub(crate) struct Observers {
    next_id: u64,
    changes: Vec<(Subscription, ChangeListener)>,
    updates_v1: Vec<(Subscription, UpdateListener)>,
    updates_v2: Vec<(Subscription, UpdateListener)>,
}

impl Observers {
    fn next(&mut self) -> Subscription {
        self.next_id += 1;
        Subscription(self.next_id)
    }

    pub(crate) fn observe(&mut self, f: ChangeListener) -> Subscription {
        let sub = self.next();
        self.changes.push((sub, f));
        sub
    }

    pub(crate) fn on_update_v1(&mut self, f: UpdateListener) -> Subscription {
        let sub = self.next();
        self.updates_v1.push((sub, f));
        sub
    }

    pub(crate) fn on_update_v2(&mut self, f: UpdateListener) -> Subscription {
        let sub = self.next();
        self.updates_v2.push((sub, f));
        sub
    }

    pub(crate) fn unobserve(&mut self, sub: Subscription) -> bool {
        let before = self.changes.len() + self.updates_v1.len() + self.updates_v2.len();
        self.changes.retain(|(s, _)| *s != sub);
        self.updates_v1.retain(|(s, _)| *s != sub);
        self.updates_v2.retain(|(s, _)| *s != sub);
        before != self.changes.len() + self.updates_v1.len() + self.updates_v2.len()
    }

    pub(crate) fn wants_v1(&self) -> bool {
        !self.updates_v1.is_empty()
    }

    pub(crate) fn wants_v2(&self) -> bool {
        !self.updates_v2.is_empty()
    }

    /// Listeners only see the event. The document stays mutably borrowed by the commit
    /// for the whole dispatch, so a listener cannot start another transaction.
    pub(crate) fn notify(
        &mut self,
        event: &TransactionEvent,
        update_v1: Option<UpdateEvent>,
        update_v2: Option<UpdateEvent>,
    ) {
        for (_, listener) in self.changes.iter_mut() {
            listener(event);
        }
        if let Some(update) = update_v1 {
            for (_, listener) in self.updates_v1.iter_mut() {
                listener(&update);
            }
        }
        if let Some(update) = update_v2 {
            for (_, listener) in self.updates_v2.iter_mut() {
                listener(&update);
            }
        }
    }
}
