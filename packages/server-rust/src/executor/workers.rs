//! Worker bookkeeping for introspection and interruption.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use spaceport_core::RequestInfo;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Idle and waiting for work.
    Available,
    Busy,
}

/// The service function a worker is running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceRef {
    pub function: String,
    pub endpoint: String,
}

/// Point-in-time view of one worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub id: u64,
    pub name: String,
    pub state: WorkerState,
    /// Started on demand beyond the core size.
    pub elastic: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request: Option<RequestInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceRef>,
}

pub(crate) struct Assignment {
    pub request: Option<RequestInfo>,
    pub service: Option<ServiceRef>,
    pub cancel: CancellationToken,
}

pub(crate) struct WorkerSlot {
    pub id: u64,
    name: String,
    elastic: bool,
    current: Mutex<Option<Assignment>>,
}

impl WorkerSlot {
    pub fn begin(&self, assignment: Assignment) {
        *self.current.lock() = Some(assignment);
    }

    pub fn finish(&self) {
        self.current.lock().take();
    }

    /// Signals the unit this worker is running, if any.
    pub fn interrupt(&self) -> bool {
        match self.current.lock().as_ref() {
            Some(assignment) => {
                assignment.cancel.cancel();
                true
            }
            None => false,
        }
    }

    fn snapshot(&self) -> WorkerSnapshot {
        let current = self.current.lock();
        WorkerSnapshot {
            id: self.id,
            name: self.name.clone(),
            state: if current.is_some() {
                WorkerState::Busy
            } else {
                WorkerState::Available
            },
            elastic: self.elastic,
            request: current.as_ref().and_then(|a| a.request.clone()),
            service: current.as_ref().and_then(|a| a.service.clone()),
        }
    }
}

#[derive(Default)]
pub(crate) struct WorkerTable {
    slots: DashMap<u64, Arc<WorkerSlot>>,
    next_id: AtomicU64,
}

impl WorkerTable {
    pub fn register(&self, group: &str, elastic: bool) -> Arc<WorkerSlot> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let slot = Arc::new(WorkerSlot {
            id,
            name: format!("{group}-{id}"),
            elastic,
            current: Mutex::new(None),
        });
        self.slots.insert(id, Arc::clone(&slot));
        slot
    }

    pub fn remove(&self, id: u64) {
        self.slots.remove(&id);
    }

    pub fn clear(&self) {
        self.slots.clear();
    }

    pub fn get(&self, id: u64) -> Option<Arc<WorkerSlot>> {
        self.slots.get(&id).map(|e| Arc::clone(e.value()))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn interrupt_all(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| entry.value().interrupt())
            .count()
    }

    /// Snapshots ordered by worker id.
    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        let mut all: Vec<WorkerSnapshot> = self.slots.iter().map(|e| e.value().snapshot()).collect();
        all.sort_by_key(|s| s.id);
        all
    }
}

#[cfg(test)]
mod tests {
    use spaceport_core::Verb;

    use super::*;

    #[test]
    fn idle_workers_report_available() {
        let table = WorkerTable::default();
        let slot = table.register("DefaultGroup", false);
        let snapshot = table.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].name, format!("DefaultGroup-{}", slot.id));
        assert_eq!(snapshot[0].state, WorkerState::Available);
        assert!(snapshot[0].request.is_none());

        let json = serde_json::to_value(&snapshot[0]).unwrap();
        assert_eq!(json["state"], "available");
    }

    #[test]
    fn busy_workers_report_their_request() {
        let table = WorkerTable::default();
        let slot = table.register("g", false);
        let cancel = CancellationToken::new();
        slot.begin(Assignment {
            request: Some(RequestInfo {
                id: "r1".into(),
                verb: Verb::Get,
                endpoint: "/users/1".into(),
                timestamp: 1,
            }),
            service: Some(ServiceRef {
                function: "Users.Get".into(),
                endpoint: "/users/:id".into(),
            }),
            cancel: cancel.clone(),
        });

        let snapshot = &table.snapshot()[0];
        assert_eq!(snapshot.state, WorkerState::Busy);
        assert_eq!(snapshot.request.as_ref().unwrap().endpoint, "/users/1");
        assert_eq!(snapshot.service.as_ref().unwrap().function, "Users.Get");

        assert!(table.get(slot.id).unwrap().interrupt());
        assert!(cancel.is_cancelled());

        slot.finish();
        assert!(!slot.interrupt());
        table.remove(slot.id);
        assert_eq!(table.len(), 0);
    }
}
