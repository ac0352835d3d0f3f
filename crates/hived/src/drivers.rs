//! Collaborators the daemon hands to the monitor.
//!
//! - [`CommandDriver`] runs actions and status probes through an external
//!   command: `<command…> <path> <action> [flags]`.
//! - [`FlagFreezer`] keeps freeze flags as files under the var directory.
//! - [`TomlConfigProvider`] serves the `[[object]]` tables plus the scaler
//!   slaves created at runtime, persisted next to the freeze flags.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::process::Command;
use tracing::{debug, info};

use hive_monitor::{
    Action, ActionRunner, BoxFuture, ConfigProvider, Freezer, MonitorError, MonitorResult, ObjectConfig,
    StatusProvider,
};
use hive_state::{InstanceStatus, ObjectPath};

/// Longest stderr excerpt carried in an action error.
const STDERR_EXCERPT: usize = 512;

#[derive(Debug, Clone)]
pub struct CommandDriver {
    command: Vec<String>,
    timeout: Duration,
}

impl CommandDriver {
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self { command, timeout }
    }

    fn command(&self, path: &str, verb: &str, flags: &[String]) -> MonitorResult<Command> {
        let (program, leading) = self
            .command
            .split_first()
            .ok_or_else(|| MonitorError::Config("empty action command".into()))?;
        let mut cmd = Command::new(program);
        cmd.args(leading)
            .arg(path)
            .arg(verb)
            .args(flags)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }
}

/// Run `cmd` to completion within `timeout` and return its stdout.
async fn output(mut cmd: Command, path: String, verb: String, timeout: Duration) -> MonitorResult<Vec<u8>> {
    let failed = |message: String| MonitorError::Action {
        path: path.clone(),
        action: verb.clone(),
        message,
    };
    let out = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(out) => out?,
        Err(_) => return Err(failed(format!("timed out after {timeout:?}"))),
    };
    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        let stderr = stderr.trim();
        let excerpt: String = stderr.chars().take(STDERR_EXCERPT).collect();
        return Err(failed(format!("{}: {excerpt}", out.status)));
    }
    Ok(out.stdout)
}

impl ActionRunner for CommandDriver {
    fn run(&self, path: &str, action: Action) -> BoxFuture<MonitorResult<()>> {
        let cmd = self.command(path, action.name(), &action.flags());
        let timeout = self.timeout;
        let path = path.to_string();
        Box::pin(async move {
            debug!(%path, %action, "running action command");
            output(cmd?, path, action.to_string(), timeout).await.map(|_| ())
        })
    }
}

impl StatusProvider for CommandDriver {
    fn instance_status(&self, path: &str) -> BoxFuture<MonitorResult<InstanceStatus>> {
        let cmd = self.command(path, "status", &[]);
        let timeout = self.timeout;
        let path = path.to_string();
        Box::pin(async move {
            let stdout = output(cmd?, path.clone(), "status".into(), timeout).await?;
            serde_json::from_slice(&stdout).map_err(|e| MonitorError::Action {
                path,
                action: "status".into(),
                message: format!("undecodable status: {e}"),
            })
        })
    }
}

/// Freeze flags as files: `<dir>/node` for the node, `<dir>/objects/<path>`
/// for instances.
#[derive(Debug, Clone)]
pub struct FlagFreezer {
    dir: PathBuf,
}

impl FlagFreezer {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn node_flag(&self) -> PathBuf {
        self.dir.join("node")
    }

    fn object_flag(&self, path: &str) -> PathBuf {
        self.dir.join("objects").join(path)
    }
}

fn set_flag(flag: &Path) -> MonitorResult<()> {
    if let Some(parent) = flag.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(flag, b"")?;
    Ok(())
}

fn clear_flag(flag: &Path) -> MonitorResult<()> {
    match std::fs::remove_file(flag) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

impl Freezer for FlagFreezer {
    fn is_frozen(&self, path: &str) -> bool {
        self.object_flag(path).exists()
    }

    fn freeze(&self, path: &str) -> MonitorResult<()> {
        set_flag(&self.object_flag(path))
    }

    fn thaw(&self, path: &str) -> MonitorResult<()> {
        clear_flag(&self.object_flag(path))
    }

    fn node_frozen(&self) -> bool {
        self.node_flag().exists()
    }

    fn freeze_node(&self) -> MonitorResult<()> {
        set_flag(&self.node_flag())
    }

    fn thaw_node(&self) -> MonitorResult<()> {
        clear_flag(&self.node_flag())
    }
}

pub struct TomlConfigProvider {
    objects: RwLock<BTreeMap<ObjectPath, ObjectConfig>>,
    slaves: RwLock<BTreeMap<ObjectPath, ObjectConfig>>,
    slaves_file: PathBuf,
}

impl TomlConfigProvider {
    /// Serve `objects`, plus the slaves persisted in `slaves_file` by a
    /// previous run.
    pub fn new(objects: Vec<ObjectConfig>, slaves_file: impl Into<PathBuf>) -> MonitorResult<Self> {
        let slaves_file = slaves_file.into();
        let slaves: BTreeMap<ObjectPath, ObjectConfig> = match std::fs::read(&slaves_file) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| MonitorError::Config(format!("{}: {e}", slaves_file.display())))?,
            Err(e) if e.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            objects: RwLock::new(to_map(objects)),
            slaves: RwLock::new(slaves),
            slaves_file,
        })
    }

    /// Swap in a reloaded object list. Slaves of scalers that are gone are
    /// forgotten.
    pub fn replace(&self, objects: Vec<ObjectConfig>) -> MonitorResult<()> {
        let objects = to_map(objects);
        let mut slaves = self.slaves.write();
        slaves.retain(|path, _| {
            objects
                .values()
                .filter(|o| o.is_scaler())
                .any(|scaler| hive_monitor::scaler::slave_index(&scaler.path, path).is_some())
        });
        self.persist(&slaves)?;
        *self.objects.write() = objects;
        Ok(())
    }

    fn persist(&self, slaves: &BTreeMap<ObjectPath, ObjectConfig>) -> MonitorResult<()> {
        if let Some(parent) = self.slaves_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let encoded = serde_json::to_vec_pretty(slaves).map_err(|e| MonitorError::Config(e.to_string()))?;
        let tmp = self.slaves_file.with_extension("tmp");
        std::fs::write(&tmp, encoded)?;
        std::fs::rename(&tmp, &self.slaves_file)?;
        Ok(())
    }
}

fn to_map(objects: Vec<ObjectConfig>) -> BTreeMap<ObjectPath, ObjectConfig> {
    objects.into_iter().map(|o| (o.path.clone(), o)).collect()
}

impl ConfigProvider for TomlConfigProvider {
    fn objects(&self) -> Vec<ObjectPath> {
        let mut paths: Vec<ObjectPath> = self.objects.read().keys().cloned().collect();
        paths.extend(self.slaves.read().keys().cloned());
        paths.sort();
        paths.dedup();
        paths
    }

    fn object(&self, path: &str) -> Option<ObjectConfig> {
        if let Some(object) = self.objects.read().get(path) {
            return Some(object.clone());
        }
        self.slaves.read().get(path).cloned()
    }

    /// A slave is a flex object on the scaler's nodes, `width` instances
    /// wide.
    fn create_slave(&self, scaler: &str, slave: &str, width: u32) -> MonitorResult<()> {
        let parent = self
            .object(scaler)
            .ok_or_else(|| MonitorError::ObjectNotFound(scaler.to_string()))?;
        let config = ObjectConfig {
            path: slave.to_string(),
            scale: None,
            slave_size: 1,
            ..parent
        }
        .with_flex(width, width, width);
        let mut slaves = self.slaves.write();
        if slaves.get(slave) == Some(&config) {
            return Ok(());
        }
        info!(path = %slave, %scaler, width, "slave config written");
        slaves.insert(slave.to_string(), config);
        self.persist(&slaves)
    }
}
