//! Holding area for requests that arrive before the connection is live.

use crate::config::{PendingPolicy, SupersedePolicy};
use crate::connector::PeerConnector;
use crate::request::{RequestId, RequestTicket, TrackedRequest, UntrackedRequest};
use std::collections::VecDeque;
use std::fmt;

/// A tracked request together with its ticket.
pub(crate) struct TrackedEntry<P: PeerConnector> {
    pub ticket: RequestTicket,
    pub request: Box<dyn TrackedRequest<P>>,
}

impl<P: PeerConnector> TrackedEntry<P> {
    pub fn id(&self) -> RequestId {
        self.ticket.id()
    }

    pub fn label(&self) -> String {
        format!("{}#{}", self.request.label(), self.ticket.id())
    }
}

/// One unit of work waiting for (or running against) the connection.
pub(crate) enum Pending<P: PeerConnector> {
    Tracked(TrackedEntry<P>),
    Untracked(UntrackedRequest<P::Interface>),
}

impl<P: PeerConnector> fmt::Display for Pending<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pending::Tracked(entry) => write!(f, "{}", entry.label()),
            Pending::Untracked(_) => write!(f, "async request"),
        }
    }
}

/// Decision for a tracked request arriving under a pending policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Accept,
    /// Accept, after cancelling the given unresolved request.
    Supersede(RequestId),
    /// Refuse the new request.
    Reject,
}

/// Apply a pending policy given the currently unresolved tracked request.
pub(crate) fn admit(policy: PendingPolicy, unresolved: Option<RequestId>) -> Admission {
    match (policy, unresolved) {
        (PendingPolicy::Multiple, _) | (PendingPolicy::Single(_), None) => Admission::Accept,
        (PendingPolicy::Single(SupersedePolicy::Supersede), Some(id)) => Admission::Supersede(id),
        (PendingPolicy::Single(SupersedePolicy::Reject), Some(_)) => Admission::Reject,
    }
}

/// FIFO queue of pending work. Insertion order is execution order.
pub(crate) struct PendingQueue<P: PeerConnector> {
    entries: VecDeque<Pending<P>>,
}

impl<P: PeerConnector> Default for PendingQueue<P> {
    fn default() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }
}

impl<P: PeerConnector> PendingQueue<P> {
    pub fn push(&mut self, pending: Pending<P>) {
        self.entries.push_back(pending);
    }

    /// Take every entry out, leaving the queue empty.
    pub fn take_all(&mut self) -> VecDeque<Pending<P>> {
        std::mem::take(&mut self.entries)
    }

    /// Remove a queued tracked request by id.
    pub fn remove_tracked(&mut self, id: RequestId) -> Option<TrackedEntry<P>> {
        let index = self
            .entries
            .iter()
            .position(|p| matches!(p, Pending::Tracked(entry) if entry.id() == id))?;
        match self.entries.remove(index) {
            Some(Pending::Tracked(entry)) => Some(entry),
            _ => None,
        }
    }

    /// Id of the oldest queued tracked request.
    pub fn first_tracked(&self) -> Option<RequestId> {
        self.entries.iter().find_map(|p| match p {
            Pending::Tracked(entry) => Some(entry.id()),
            Pending::Untracked(_) => None,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::testing::NullConnector;
    use crate::manager::PeerManager;
    use std::sync::Arc;

    struct Named(&'static str);

    impl TrackedRequest<NullConnector> for Named {
        fn run(&mut self, _: &(), _: RequestTicket) {}
        fn on_timeout(&mut self, _: &PeerManager<NullConnector>) {}
        fn label(&self) -> &str {
            self.0
        }
    }

    fn tracked(id: RequestId, name: &'static str) -> Pending<NullConnector> {
        Pending::Tracked(TrackedEntry {
            ticket: RequestTicket::new(id, Arc::new(|_| true)),
            request: Box::new(Named(name)),
        })
    }

    fn untracked() -> Pending<NullConnector> {
        Pending::Untracked(Box::new(|_: &()| Ok(())))
    }

    #[test]
    fn test_admit_multiple_always_accepts() {
        assert_eq!(admit(PendingPolicy::Multiple, None), Admission::Accept);
        assert_eq!(admit(PendingPolicy::Multiple, Some(3)), Admission::Accept);
    }

    #[test]
    fn test_admit_single() {
        let supersede = PendingPolicy::Single(SupersedePolicy::Supersede);
        let reject = PendingPolicy::Single(SupersedePolicy::Reject);

        assert_eq!(admit(supersede, None), Admission::Accept);
        assert_eq!(admit(supersede, Some(9)), Admission::Supersede(9));
        assert_eq!(admit(reject, None), Admission::Accept);
        assert_eq!(admit(reject, Some(9)), Admission::Reject);
    }

    #[test]
    fn test_take_all_preserves_order() {
        let mut queue = PendingQueue::default();
        queue.push(tracked(1, "a"));
        queue.push(untracked());
        queue.push(tracked(2, "b"));
        assert_eq!(queue.len(), 3);

        let labels: Vec<String> = queue.take_all().iter().map(|p| p.to_string()).collect();
        assert_eq!(labels, vec!["a#1", "async request", "b#2"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_remove_tracked() {
        let mut queue = PendingQueue::default();
        queue.push(untracked());
        queue.push(tracked(1, "a"));
        queue.push(tracked(2, "b"));

        assert_eq!(queue.first_tracked(), Some(1));
        let removed = queue.remove_tracked(1).unwrap();
        assert_eq!(removed.id(), 1);
        assert!(queue.remove_tracked(1).is_none());
        assert_eq!(queue.first_tracked(), Some(2));
        assert_eq!(queue.len(), 2);
    }
}
