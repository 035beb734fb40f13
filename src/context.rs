//! Ambient facts the host platform supplies: who is acting, in which
//! project, what time it is, and the lookups used by `user`, `project` and
//! `record` property validation.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;

pub trait HostContext: Send + Sync {
    /// Authenticated user, if any.
    fn user_id(&self) -> Option<String>;
    /// Current project, absent outside project-scoped contexts.
    fn project_id(&self) -> Option<i64>;
    fn now(&self) -> i64 {
        Utc::now().timestamp()
    }
    fn is_super_user(&self) -> bool;
    fn has_privilege(&self, project_id: i64, user_id: &str) -> bool;
    fn username_exists(&self, username: &str) -> bool;
    fn project_exists(&self, project_id: i64) -> bool;
    fn record_exists(&self, project_id: i64, record: &str) -> bool;
}

/// A self-contained context backed by in-memory sets, for the command line
/// and for tests. The clock is either the system clock or a ticking counter
/// that advances one second per reading.
#[derive(Debug, Default)]
pub struct StaticContext {
    user: Option<String>,
    project: Option<i64>,
    super_user: bool,
    users: HashSet<String>,
    projects: HashSet<i64>,
    privileges: HashSet<(i64, String)>,
    records: HashMap<i64, HashSet<String>>,
    clock: Option<AtomicI64>,
}

impl StaticContext {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn acting_as(mut self, user: &str) -> Self {
        self.users.insert(user.to_owned());
        self.user = Some(user.to_owned());
        self
    }
    pub fn in_project(mut self, project: i64) -> Self {
        self.projects.insert(project);
        self.project = Some(project);
        self
    }
    pub fn super_user(mut self) -> Self {
        self.super_user = true;
        self
    }
    pub fn with_user(mut self, user: &str) -> Self {
        self.users.insert(user.to_owned());
        self
    }
    pub fn with_project(mut self, project: i64) -> Self {
        self.projects.insert(project);
        self
    }
    pub fn with_privilege(mut self, project: i64, user: &str) -> Self {
        self.privileges.insert((project, user.to_owned()));
        self
    }
    pub fn with_record(mut self, project: i64, record: &str) -> Self {
        self.records.entry(project).or_default().insert(record.to_owned());
        self
    }
    pub fn with_ticking_clock(mut self, start: i64) -> Self {
        self.clock = Some(AtomicI64::new(start));
        self
    }
}

impl HostContext for StaticContext {
    fn user_id(&self) -> Option<String> {
        self.user.clone()
    }
    fn project_id(&self) -> Option<i64> {
        self.project
    }
    fn now(&self) -> i64 {
        match &self.clock {
            Some(clock) => clock.fetch_add(1, Ordering::SeqCst),
            None => Utc::now().timestamp(),
        }
    }
    fn is_super_user(&self) -> bool {
        self.super_user
    }
    fn has_privilege(&self, project_id: i64, user_id: &str) -> bool {
        self.privileges.contains(&(project_id, user_id.to_owned()))
    }
    fn username_exists(&self, username: &str) -> bool {
        self.users.contains(username)
    }
    fn project_exists(&self, project_id: i64) -> bool {
        self.projects.contains(&project_id)
    }
    fn record_exists(&self, project_id: i64, record: &str) -> bool {
        self.records.get(&project_id).is_some_and(|r| r.contains(record))
    }
}
