//! In-memory collaborators for driving the engine in tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::Semaphore;

use hive_state::{InstanceStatus, ObjectPath};

use crate::collaborators::{Action, ActionRunner, BoxFuture, ConfigProvider, Freezer, StatusProvider};
use crate::config::ObjectConfig;
use crate::error::{MonitorError, MonitorResult};

/// Records every launched action. Actions on `failing` paths fail; when
/// holding, actions only complete after [`RecordingRunner::release`].
#[derive(Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<(ObjectPath, Action)>>,
    failing: Mutex<BTreeSet<ObjectPath>>,
    hold: Option<Arc<Semaphore>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn holding() -> Self {
        Self {
            hold: Some(Arc::new(Semaphore::new(0))),
            ..Self::default()
        }
    }

    pub fn fail(&self, path: &str) {
        self.failing.lock().insert(path.to_string());
    }

    pub fn release(&self) {
        if let Some(hold) = &self.hold {
            hold.add_permits(1024);
        }
    }

    pub fn calls(&self) -> Vec<(ObjectPath, Action)> {
        self.calls.lock().clone()
    }
}

impl ActionRunner for RecordingRunner {
    fn run(&self, path: &str, action: Action) -> BoxFuture<MonitorResult<()>> {
        self.calls.lock().push((path.to_string(), action.clone()));
        let fails = self.failing.lock().contains(path);
        let hold = self.hold.clone();
        let path = path.to_string();
        Box::pin(async move {
            if let Some(hold) = hold {
                let _permit = hold.acquire().await;
            }
            if fails {
                return Err(MonitorError::Action {
                    path,
                    action: action.to_string(),
                    message: "injected failure".into(),
                });
            }
            Ok(())
        })
    }
}

#[derive(Default)]
pub struct MemoryFreezer {
    node: AtomicBool,
    paths: Mutex<BTreeSet<ObjectPath>>,
}

impl MemoryFreezer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Freezer for MemoryFreezer {
    fn is_frozen(&self, path: &str) -> bool {
        self.paths.lock().contains(path)
    }

    fn freeze(&self, path: &str) -> MonitorResult<()> {
        self.paths.lock().insert(path.to_string());
        Ok(())
    }

    fn thaw(&self, path: &str) -> MonitorResult<()> {
        self.paths.lock().remove(path);
        Ok(())
    }

    fn node_frozen(&self) -> bool {
        self.node.load(Ordering::SeqCst)
    }

    fn freeze_node(&self) -> MonitorResult<()> {
        self.node.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn thaw_node(&self) -> MonitorResult<()> {
        self.node.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct StaticConfig {
    objects: Mutex<BTreeMap<ObjectPath, ObjectConfig>>,
}

impl StaticConfig {
    pub fn new(objects: impl IntoIterator<Item = ObjectConfig>) -> Self {
        Self {
            objects: Mutex::new(objects.into_iter().map(|o| (o.path.clone(), o)).collect()),
        }
    }

    pub fn insert(&self, object: ObjectConfig) {
        self.objects.lock().insert(object.path.clone(), object);
    }

    pub fn remove(&self, path: &str) {
        self.objects.lock().remove(path);
    }
}

impl ConfigProvider for StaticConfig {
    fn objects(&self) -> Vec<ObjectPath> {
        self.objects.lock().keys().cloned().collect()
    }

    fn object(&self, path: &str) -> Option<ObjectConfig> {
        self.objects.lock().get(path).cloned()
    }

    /// Slaves inherit the scaler's nodes and placement.
    fn create_slave(&self, scaler: &str, slave: &str, width: u32) -> MonitorResult<()> {
        let mut objects = self.objects.lock();
        let parent = objects
            .get(scaler)
            .cloned()
            .ok_or_else(|| MonitorError::ObjectNotFound(scaler.to_string()))?;
        let mut config = ObjectConfig {
            path: slave.to_string(),
            scale: None,
            slave_size: 1,
            ..parent
        };
        config = config.with_flex(width, width, width);
        objects.insert(slave.to_string(), config);
        Ok(())
    }
}

/// Instance statuses set by the test. Unknown paths report an error, so the
/// previously published status is kept.
#[derive(Default)]
pub struct StaticStatus {
    statuses: Mutex<BTreeMap<ObjectPath, InstanceStatus>>,
}

impl StaticStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, path: &str, status: InstanceStatus) {
        self.statuses.lock().insert(path.to_string(), status);
    }
}

impl StatusProvider for StaticStatus {
    fn instance_status(&self, path: &str) -> BoxFuture<MonitorResult<InstanceStatus>> {
        let status = self
            .statuses
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| MonitorError::ObjectNotFound(path.to_string()));
        Box::pin(async move { status })
    }
}
