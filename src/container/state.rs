use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};

use super::model::empty_as_none;
use super::{Container, ContainerID};

/// Lifecycle status of a container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Dead,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Created => "created",
            Status::Running => "running",
            Status::Paused => "paused",
            Status::Restarting => "restarting",
            Status::Exited => "exited",
            Status::Dead => "dead",
        }
    }

    /// The per-status booleans older consumers expect. At most one is set.
    pub fn flags(&self) -> StatusFlags {
        StatusFlags {
            running: *self == Status::Running,
            paused: *self == Status::Paused,
            restarting: *self == Status::Restarting,
            exited: *self == Status::Exited,
            dead: *self == Status::Dead,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Boolean view of a [`Status`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StatusFlags {
    pub running: bool,
    pub paused: bool,
    pub restarting: bool,
    pub exited: bool,
    pub dead: bool,
}

/// Running state and lifecycle telemetry of a container.
///
/// Transitions are unconditional; callers serialize them per container with
/// [`ContainerLocks`](super::ContainerLocks).
///
/// Serialized records carry the [`StatusFlags`] next to `Status`; they are ignored
/// when read back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ContainerState {
    status: Status,
    pub pid: i64,
    pub exit_code: i64,
    #[serde(deserialize_with = "empty_as_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "empty_as_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub error: String,
    #[serde(rename = "OOMKilled")]
    pub oom_killed: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct StateRecord<'a> {
    status: Status,
    #[serde(flatten)]
    flags: StatusFlags,
    pid: i64,
    exit_code: i64,
    started_at: &'a Option<DateTime<Utc>>,
    finished_at: &'a Option<DateTime<Utc>>,
    error: &'a str,
    #[serde(rename = "OOMKilled")]
    oom_killed: bool,
}

impl Serialize for ContainerState {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        StateRecord {
            status: self.status,
            flags: self.flags(),
            pid: self.pid,
            exit_code: self.exit_code,
            started_at: &self.started_at,
            finished_at: &self.finished_at,
            error: &self.error,
            oom_killed: self.oom_killed,
        }
        .serialize(serializer)
    }
}

impl ContainerState {
    pub fn status(&self) -> Status {
        self.status
    }

    pub fn flags(&self) -> StatusFlags {
        self.status.flags()
    }

    pub fn exit_code(&self) -> i64 {
        self.exit_code
    }

    pub fn is_created(&self) -> bool {
        self.status == Status::Created
    }

    pub fn is_running(&self) -> bool {
        self.status == Status::Running
    }

    pub fn is_paused(&self) -> bool {
        self.status == Status::Paused
    }

    pub fn is_running_or_paused(&self) -> bool {
        self.is_running() || self.is_paused()
    }

    pub fn is_restarting(&self) -> bool {
        self.status == Status::Restarting
    }

    pub fn is_exited(&self) -> bool {
        self.status == Status::Exited
    }

    pub fn is_dead(&self) -> bool {
        self.status == Status::Dead
    }

    /// Sets the status without touching any telemetry.
    pub fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    /// Marks the container running as process `pid` and clears the exit code.
    pub fn set_running(&mut self, pid: i64) {
        self.started_at = Some(Utc::now());
        self.pid = pid;
        self.exit_code = 0;
        self.status = Status::Running;
    }

    pub fn set_restarting(&mut self) {
        self.status = Status::Restarting;
    }

    /// Marks the container exited with `exit_code` and the error message, if any.
    pub fn set_exited(&mut self, exit_code: i64, err_msg: impl Into<String>) {
        self.finished_at = Some(Utc::now());
        self.pid = 0;
        self.exit_code = exit_code;
        self.error = err_msg.into();
        self.status = Status::Exited;
    }

    pub fn set_paused(&mut self) {
        self.status = Status::Paused;
    }

    /// An unpaused container is running again.
    pub fn set_unpaused(&mut self) {
        self.status = Status::Running;
    }

    pub fn set_dead(&mut self) {
        self.status = Status::Dead;
    }

    /// Records an OOM kill. The status is left to the exit path.
    pub fn set_oom(&mut self) {
        self.oom_killed = true;
        self.error = "OOMKilled".to_owned();
    }
}

/// A lifecycle operation that the current status does not allow.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StateError {
    #[error("cannot start a paused container {0}, try unpause instead")]
    StartPaused(ContainerID),
    #[error("container {0} already started")]
    AlreadyStarted(ContainerID),
    #[error("can not start a restarting container {0}")]
    StartRestarting(ContainerID),
    #[error("cannot start a dead container {0}")]
    StartDead(ContainerID),
}

impl StateError {
    /// True if the operation was a no-op rather than a failure.
    pub fn is_not_modified(&self) -> bool {
        matches!(self, StateError::AlreadyStarted(_))
    }
}

impl Container {
    /// Checks that the container may be started.
    pub fn validate_start(&self) -> Result<(), StateError> {
        let id = || self.id.clone();
        match self.state.status() {
            Status::Paused => Err(StateError::StartPaused(id())),
            Status::Running => Err(StateError::AlreadyStarted(id())),
            Status::Restarting => Err(StateError::StartRestarting(id())),
            Status::Dead => Err(StateError::StartDead(id())),
            Status::Created | Status::Exited => Ok(()),
        }
    }

    /// Checks that the container may be stopped. Every status is accepted.
    pub fn validate_stop(&self) -> Result<(), StateError> {
        Ok(())
    }
}
