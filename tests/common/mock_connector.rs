//! Mock RepositoryConnector for testing.
//!
//! Serves records from an in-memory map, records every call, and can be
//! told to fail or to stall before answering.

use cohort_engine::connector::{BoxFuture, ConnectorError, InstanceRecord, RepositoryConnector};
use cohort_engine::federation::QueryCriteria;
use cohort_engine::types::{InstanceBody, InstanceGuid, MemberId};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// A recorded connector call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorCall {
    Find,
    GetByGuid(String),
}

/// # Example
/// ```rust,ignore
/// let mock = MockConnector::new("member-a");
/// mock.put("g1", 1, body("x", 10));
/// mock.set_delay(Duration::from_secs(5)); // slower than the query timeout
///
/// // ... run a federated query ...
///
/// assert_eq!(mock.call_count(), 1);
/// ```
pub struct MockConnector {
    member_id: MemberId,
    records: Mutex<BTreeMap<InstanceGuid, InstanceRecord>>,
    calls: Mutex<Vec<ConnectorCall>>,
    delay: Mutex<Option<Duration>>,
    failing: AtomicBool,
    fail_next: AtomicUsize,
    completed: AtomicUsize,
}

impl MockConnector {
    pub fn new(member_id: &str) -> Self {
        Self {
            member_id: MemberId::new(member_id),
            records: Mutex::new(BTreeMap::new()),
            calls: Mutex::new(Vec::new()),
            delay: Mutex::new(None),
            failing: AtomicBool::new(false),
            fail_next: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
        }
    }

    /// Store a record homed at this member.
    pub fn put(&self, guid: &str, version: u64, body: InstanceBody) {
        let record = InstanceRecord::home(guid, self.member_id.clone(), version, body);
        self.records.lock().insert(InstanceGuid::new(guid), record);
    }

    /// Store an arbitrary record (e.g. one claiming another home).
    pub fn put_record(&self, record: InstanceRecord) {
        self.records.lock().insert(record.guid.clone(), record);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Fail the next `n` calls, then recover.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<ConnectorCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Calls that ran to completion (not timed out or aborted).
    pub fn completed_count(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    async fn respond<T>(&self, value: T) -> Result<T, ConnectorError> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.completed.fetch_add(1, Ordering::SeqCst);
        let transient = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if transient || self.failing.load(Ordering::SeqCst) {
            return Err(ConnectorError(format!("{} unavailable", self.member_id)));
        }
        Ok(value)
    }
}

impl RepositoryConnector for MockConnector {
    fn member_id(&self) -> &MemberId {
        &self.member_id
    }

    fn find(&self, criteria: &QueryCriteria) -> BoxFuture<'_, Vec<InstanceRecord>> {
        self.calls.lock().push(ConnectorCall::Find);
        let matches: Vec<InstanceRecord> = self
            .records
            .lock()
            .values()
            .filter(|r| criteria.matches_properties(&r.body))
            .cloned()
            .collect();
        Box::pin(self.respond(matches))
    }

    fn get_by_guid(&self, guid: &InstanceGuid) -> BoxFuture<'_, Option<InstanceRecord>> {
        self.calls
            .lock()
            .push(ConnectorCall::GetByGuid(guid.as_str().to_string()));
        let found = self.records.lock().get(guid).cloned();
        Box::pin(self.respond(found))
    }
}
