//! Pending-request registry.
//!
//! Owned by the connection and only touched under its state lock.

use std::collections::HashMap;
use std::sync::Arc;

use crate::Request;

/// Largest message id the protocol allows.
pub const MAX_MESSAGE_ID: u32 = i32::MAX as u32;

#[derive(Debug)]
pub struct PendingRequests {
    requests: HashMap<u32, Arc<Request>>,
    next_msg_id: u32,
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            requests: HashMap::new(),
            next_msg_id: 1,
        }
    }

    /// Fresh, strictly increasing id starting at 1. `None` once the id space
    /// is used up; ids are never reused.
    pub fn next_message_id(&mut self) -> Option<u32> {
        if self.next_msg_id > MAX_MESSAGE_ID {
            return None;
        }
        let id = self.next_msg_id;
        self.next_msg_id += 1;
        Some(id)
    }

    pub fn add(&mut self, request: Arc<Request>) {
        let prev = self.requests.insert(request.msg_id(), request);
        debug_assert!(prev.is_none(), "message id registered twice");
    }

    pub fn find(&self, msg_id: u32) -> Option<Arc<Request>> {
        self.requests.get(&msg_id).cloned()
    }

    /// Unlink `request` and mark it cancelled. Returns whether it was
    /// registered.
    pub fn remove(&mut self, request: &Request) -> bool {
        request.cancel();
        self.requests.remove(&request.msg_id()).is_some()
    }

    /// Remove and return every entry.
    pub fn drain(&mut self) -> Vec<Arc<Request>> {
        self.requests.drain().map(|(_, req)| req).collect()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Sorted ids of outstanding requests.
    pub fn message_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.requests.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RequestOptions, RequestState};

    #[test]
    fn ids_start_at_one_and_increase() {
        let mut reg = PendingRequests::new();
        let ids: Vec<u32> = (0..5).map(|_| reg.next_message_id().unwrap()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn id_space_is_not_reused() {
        let mut reg = PendingRequests::new();
        reg.next_msg_id = MAX_MESSAGE_ID;
        assert_eq!(reg.next_message_id(), Some(MAX_MESSAGE_ID));
        assert_eq!(reg.next_message_id(), None);
        assert_eq!(reg.next_message_id(), None);
    }

    #[test]
    fn remove_cancels() {
        let mut reg = PendingRequests::new();
        let req = Arc::new(Request::new(3, RequestOptions::default()));
        reg.add(req.clone());
        assert!(reg.find(3).is_some());
        assert!(reg.remove(&req));
        assert!(reg.find(3).is_none());
        assert_eq!(req.state(), RequestState::Cancelled);
        assert!(!reg.remove(&req));
    }

    #[test]
    fn lists_ids_sorted() {
        let mut reg = PendingRequests::new();
        for id in [9, 2, 5] {
            reg.add(Arc::new(Request::new(id, RequestOptions::default())));
        }
        assert_eq!(reg.message_ids(), vec![2, 5, 9]);
        assert_eq!(reg.drain().len(), 3);
        assert!(reg.is_empty());
    }
}
