//! Persistence contract consumed by the engine, plus an in-memory store.
//!
//! The engine is the only concurrent writer of sessions, cycles and issues,
//! so the contract is plain read-modify-write with no transactions.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;

use crate::agents::builtin_agents;
use crate::error::{Error, Result};
use crate::model::{Agent, AgentRun, Cycle, Issue, IssueStatus, Session};

/// CRUD surface for engine records.
///
/// `create_*` methods assign a fresh id and return the stored record.
pub trait Store: Send + Sync {
    fn create_session(&self, session: Session) -> Result<Session>;
    fn get_session(&self, id: &str) -> Result<Session>;
    fn update_session(&self, session: &Session) -> Result<()>;
    fn list_sessions(&self) -> Result<Vec<Session>>;

    fn create_cycle(&self, cycle: Cycle) -> Result<Cycle>;
    fn get_cycle(&self, id: &str) -> Result<Cycle>;
    fn update_cycle(&self, cycle: &Cycle) -> Result<()>;
    /// Cycles of one session ordered by cycle number.
    fn list_cycles(&self, session_id: &str) -> Result<Vec<Cycle>>;

    fn create_issue(&self, issue: Issue) -> Result<Issue>;
    fn get_issue(&self, id: &str) -> Result<Issue>;
    fn update_issue(&self, issue: &Issue) -> Result<()>;
    /// All issues in creation order.
    fn list_issues(&self) -> Result<Vec<Issue>>;
    /// Open issues ordered by priority, then age.
    fn list_open_issues(&self) -> Result<Vec<Issue>>;

    fn get_setting(&self, key: &str) -> Result<Option<String>>;
    fn upsert_setting(&self, key: &str, value: &str) -> Result<()>;
    fn settings(&self) -> Result<BTreeMap<String, String>>;

    /// Agents ordered by pipeline position.
    fn list_agents(&self) -> Result<Vec<Agent>>;
    fn create_agent(&self, agent: Agent) -> Result<Agent>;
    fn update_agent(&self, agent: &Agent) -> Result<()>;
    /// Built-in agents cannot be deleted.
    fn delete_agent(&self, id: &str) -> Result<()>;

    fn create_agent_run(&self, run: AgentRun) -> Result<AgentRun>;
    fn update_agent_run(&self, run: &AgentRun) -> Result<()>;
    /// Runs of one cycle in creation order.
    fn list_agent_runs(&self, cycle_id: &str) -> Result<Vec<AgentRun>>;
}

#[derive(Default)]
struct Tables {
    sessions: Vec<Session>,
    cycles: Vec<Cycle>,
    issues: Vec<Issue>,
    settings: BTreeMap<String, String>,
    agents: Vec<Agent>,
    agent_runs: Vec<AgentRun>,
}

/// Mutex-guarded in-memory [`Store`].
///
/// Records are kept in insertion order, which doubles as creation order.
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Replaces the record with the same id.
fn replace<T: Clone>(
    rows: &mut [T],
    kind: &'static str,
    id: &str,
    row_id: impl Fn(&T) -> &str,
    value: &T,
) -> Result<()> {
    let slot = rows
        .iter_mut()
        .find(|row| row_id(row) == id)
        .ok_or_else(|| Error::not_found(kind, id))?;
    *slot = value.clone();
    Ok(())
}

fn find<T: Clone>(rows: &[T], kind: &'static str, id: &str, row_id: impl Fn(&T) -> &str) -> Result<T> {
    rows.iter()
        .find(|row| row_id(row) == id)
        .cloned()
        .ok_or_else(|| Error::not_found(kind, id))
}

impl MemoryStore {
    /// Creates a store seeded with the built-in agents.
    pub fn new() -> Self {
        let store = Self {
            tables: Mutex::new(Tables::default()),
        };
        {
            let mut tables = store.lock();
            for mut agent in builtin_agents() {
                agent.id = new_id();
                tables.agents.push(agent);
            }
        }
        store
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Store for MemoryStore {
    fn create_session(&self, mut session: Session) -> Result<Session> {
        session.id = new_id();
        self.lock().sessions.push(session.clone());
        Ok(session)
    }

    fn get_session(&self, id: &str) -> Result<Session> {
        find(&self.lock().sessions, "session", id, |s| s.id.as_str())
    }

    fn update_session(&self, session: &Session) -> Result<()> {
        let mut session = session.clone();
        session.updated_at = Utc::now();
        replace(&mut self.lock().sessions, "session", &session.id, |s| s.id.as_str(), &session)
    }

    fn list_sessions(&self) -> Result<Vec<Session>> {
        Ok(self.lock().sessions.clone())
    }

    fn create_cycle(&self, mut cycle: Cycle) -> Result<Cycle> {
        let mut tables = self.lock();
        if !tables.sessions.iter().any(|s| s.id == cycle.session_id) {
            return Err(Error::not_found("session", &cycle.session_id));
        }
        cycle.id = new_id();
        tables.cycles.push(cycle.clone());
        Ok(cycle)
    }

    fn get_cycle(&self, id: &str) -> Result<Cycle> {
        find(&self.lock().cycles, "cycle", id, |c| c.id.as_str())
    }

    fn update_cycle(&self, cycle: &Cycle) -> Result<()> {
        replace(&mut self.lock().cycles, "cycle", &cycle.id, |c| c.id.as_str(), cycle)
    }

    fn list_cycles(&self, session_id: &str) -> Result<Vec<Cycle>> {
        let mut cycles: Vec<Cycle> = self
            .lock()
            .cycles
            .iter()
            .filter(|c| c.session_id == session_id)
            .cloned()
            .collect();
        cycles.sort_by_key(|c| c.cycle_number);
        Ok(cycles)
    }

    fn create_issue(&self, mut issue: Issue) -> Result<Issue> {
        issue.id = new_id();
        self.lock().issues.push(issue.clone());
        Ok(issue)
    }

    fn get_issue(&self, id: &str) -> Result<Issue> {
        find(&self.lock().issues, "issue", id, |i| i.id.as_str())
    }

    fn update_issue(&self, issue: &Issue) -> Result<()> {
        let mut issue = issue.clone();
        issue.updated_at = Utc::now();
        replace(&mut self.lock().issues, "issue", &issue.id, |i| i.id.as_str(), &issue)
    }

    fn list_issues(&self) -> Result<Vec<Issue>> {
        Ok(self.lock().issues.clone())
    }

    fn list_open_issues(&self) -> Result<Vec<Issue>> {
        let mut open: Vec<Issue> = self
            .lock()
            .issues
            .iter()
            .filter(|i| i.status == IssueStatus::Open)
            .cloned()
            .collect();
        // Stable sort keeps creation order within a priority.
        open.sort_by_key(|i| i.priority);
        Ok(open)
    }

    fn get_setting(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock().settings.get(key).cloned())
    }

    fn upsert_setting(&self, key: &str, value: &str) -> Result<()> {
        self.lock()
            .settings
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn settings(&self) -> Result<BTreeMap<String, String>> {
        Ok(self.lock().settings.clone())
    }

    fn list_agents(&self) -> Result<Vec<Agent>> {
        let mut agents = self.lock().agents.clone();
        agents.sort_by_key(|a| a.position);
        Ok(agents)
    }

    fn create_agent(&self, mut agent: Agent) -> Result<Agent> {
        let mut tables = self.lock();
        if tables.agents.iter().any(|a| a.name == agent.name) {
            return Err(Error::Store(format!("agent '{}' already exists", agent.name)));
        }
        agent.id = new_id();
        agent.builtin = false;
        tables.agents.push(agent.clone());
        Ok(agent)
    }

    fn update_agent(&self, agent: &Agent) -> Result<()> {
        let mut tables = self.lock();
        let existing = find(&tables.agents, "agent", &agent.id, |a| a.id.as_str())?;
        let mut agent = agent.clone();
        agent.builtin = existing.builtin;
        replace(&mut tables.agents, "agent", &agent.id, |a| a.id.as_str(), &agent)
    }

    fn delete_agent(&self, id: &str) -> Result<()> {
        let mut tables = self.lock();
        let agent = find(&tables.agents, "agent", id, |a| a.id.as_str())?;
        if agent.builtin {
            return Err(Error::Store(format!(
                "built-in agent '{}' cannot be deleted",
                agent.name
            )));
        }
        tables.agents.retain(|a| a.id != id);
        tables.agent_runs.retain(|r| r.agent_id != id);
        Ok(())
    }

    fn create_agent_run(&self, mut run: AgentRun) -> Result<AgentRun> {
        run.id = new_id();
        self.lock().agent_runs.push(run.clone());
        Ok(run)
    }

    fn update_agent_run(&self, run: &AgentRun) -> Result<()> {
        replace(&mut self.lock().agent_runs, "agent run", &run.id, |r| r.id.as_str(), run)
    }

    fn list_agent_runs(&self, cycle_id: &str) -> Result<Vec<AgentRun>> {
        Ok(self
            .lock()
            .agent_runs
            .iter()
            .filter(|r| r.cycle_id == cycle_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Category, Phase, Priority};
    use std::path::PathBuf;

    #[test]
    fn sessions_round_trip_and_missing_ids_error() {
        let store = MemoryStore::new();
        let mut session = store
            .create_session(Session::new(PathBuf::from("/p"), None))
            .unwrap();
        assert!(!session.id.is_empty());

        session.total_cycles = 3;
        store.update_session(&session).unwrap();
        assert_eq!(store.get_session(&session.id).unwrap().total_cycles, 3);

        assert!(matches!(
            store.get_session("nope"),
            Err(Error::NotFound { kind: "session", .. })
        ));
    }

    #[test]
    fn cycles_list_by_number_and_require_session() {
        let store = MemoryStore::new();
        let session = store
            .create_session(Session::new(PathBuf::from("/p"), None))
            .unwrap();
        store.create_cycle(Cycle::new(&session.id, 1, Phase::Test, None)).unwrap();
        store.create_cycle(Cycle::new(&session.id, 0, Phase::Discovery, None)).unwrap();

        let numbers: Vec<_> = store
            .list_cycles(&session.id)
            .unwrap()
            .iter()
            .map(|c| c.cycle_number)
            .collect();
        assert_eq!(numbers, vec![0, 1]);
        assert!(store.create_cycle(Cycle::new("ghost", 0, Phase::Fix, None)).is_err());
    }

    #[test]
    fn open_issues_ordered_by_priority_then_age() {
        let store = MemoryStore::new();
        let titles = [("a", Priority::P2), ("b", Priority::P0), ("c", Priority::P2), ("d", Priority::P1)];
        for (title, priority) in titles {
            store
                .create_issue(Issue::new(Category::Bug, priority, title, "", 3))
                .unwrap();
        }
        let mut resolved = store
            .create_issue(Issue::new(Category::Bug, Priority::P0, "done", "", 3))
            .unwrap();
        resolved.status = IssueStatus::Resolved;
        store.update_issue(&resolved).unwrap();

        let order: Vec<_> = store
            .list_open_issues()
            .unwrap()
            .into_iter()
            .map(|i| i.title)
            .collect();
        assert_eq!(order, vec!["b", "d", "a", "c"]);
    }

    #[test]
    fn settings_upsert_overwrites() {
        let store = MemoryStore::new();
        store.upsert_setting("max_cycles", "5").unwrap();
        store.upsert_setting("max_cycles", "7").unwrap();
        assert_eq!(store.get_setting("max_cycles").unwrap().as_deref(), Some("7"));
        assert_eq!(store.get_setting("missing").unwrap(), None);
        assert_eq!(store.settings().unwrap().len(), 1);
    }

    #[test]
    fn builtin_agents_are_seeded_and_protected() {
        let store = MemoryStore::new();
        let agents = store.list_agents().unwrap();
        assert_eq!(agents.len(), 4);
        assert_eq!(agents[0].name, "architect");

        let err = store.delete_agent(&agents[0].id).unwrap_err();
        assert!(matches!(err, Error::Store(_)));

        let mut custom = agents[1].clone();
        custom.name = "docs".into();
        custom.position = 5;
        let custom = store.create_agent(custom).unwrap();
        assert!(!custom.builtin);
        store.delete_agent(&custom.id).unwrap();
        assert_eq!(store.list_agents().unwrap().len(), 4);
    }

    #[test]
    fn updating_agent_cannot_clear_builtin_flag() {
        let store = MemoryStore::new();
        let mut reviewer = store.list_agents().unwrap().remove(2);
        reviewer.builtin = false;
        reviewer.enabled = false;
        store.update_agent(&reviewer).unwrap();

        let stored = store.list_agents().unwrap().remove(2);
        assert!(stored.builtin);
        assert!(!stored.enabled);
    }

    #[test]
    fn agent_runs_listed_per_cycle() {
        let store = MemoryStore::new();
        let mut run = store
            .create_agent_run(AgentRun::new("c1", "a1", 1, "prompt".into()))
            .unwrap();
        store.create_agent_run(AgentRun::new("c2", "a1", 1, String::new())).unwrap();
        run.output = "done".into();
        store.update_agent_run(&run).unwrap();

        let runs = store.list_agent_runs("c1").unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].output, "done");
    }
}
