use crate::storage::DocRecord;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Shared doc priorities, summed over every live guard.
#[derive(Default)]
pub(crate) struct Priorities {
    map: Mutex<HashMap<String, i32>>,
}

impl Priorities {
    pub fn add(&self, doc_id: &str, priority: i32) {
        let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        *map.entry(doc_id.to_string()).or_default() += priority;
    }

    pub fn remove(&self, doc_id: &str, priority: i32) {
        let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(current) = map.get_mut(doc_id) {
            *current -= priority;
            if *current == 0 {
                map.remove(doc_id);
            }
        }
    }

    pub fn get(&self, doc_id: &str) -> i32 {
        self.map
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(doc_id)
            .copied()
            .unwrap_or(0)
    }
}

/// Work collected for one doc. Runs as a unit so one doc never has two
/// jobs in flight against the same peer.
#[derive(Debug, Default)]
pub(crate) struct DocJobs {
    /// Full reconcile through state vectors
    pub connect: bool,
    /// Remote broadcasts to apply locally
    pub pulls: Vec<DocRecord>,
    /// Local writes to forward
    pub pushes: Vec<DocRecord>,
}

/// Per-doc job queue: FIFO, with higher priorities first.
#[derive(Default)]
pub(crate) struct JobQueue {
    order: VecDeque<String>,
    jobs: HashMap<String, DocJobs>,
}

impl JobQueue {
    fn entry(&mut self, doc_id: &str) -> &mut DocJobs {
        if !self.jobs.contains_key(doc_id) {
            self.order.push_back(doc_id.to_string());
        }
        self.jobs.entry(doc_id.to_string()).or_default()
    }

    pub fn connect(&mut self, doc_id: &str) {
        self.entry(doc_id).connect = true;
    }

    pub fn pull(&mut self, record: DocRecord) {
        let doc_id = record.doc_id.clone();
        self.entry(&doc_id).pulls.push(record);
    }

    pub fn push(&mut self, record: DocRecord) {
        let doc_id = record.doc_id.clone();
        self.entry(&doc_id).pushes.push(record);
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn doc_ids(&self) -> impl Iterator<Item = &String> {
        self.order.iter()
    }

    /// Highest priority doc, oldest first among equals.
    pub fn pop(&mut self, priorities: &Priorities) -> Option<(String, DocJobs)> {
        let mut best: Option<(usize, i32)> = None;
        for (index, doc_id) in self.order.iter().enumerate() {
            let priority = priorities.get(doc_id);
            if best.is_none_or(|(_, p)| priority > p) {
                best = Some((index, priority));
            }
        }
        let (index, _) = best?;
        let doc_id = self.order.remove(index)?;
        let jobs = self.jobs.remove(&doc_id).unwrap_or_default();
        Some((doc_id, jobs))
    }
}
