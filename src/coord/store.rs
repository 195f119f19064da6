use std::collections::{BTreeMap, HashSet};
use std::sync::{
  atomic::{AtomicBool, Ordering},
  mpsc, Arc, Mutex,
};
use std::thread;

use log::{debug, trace, warn};

use super::CoordError;

type WatchCallback = Arc<dyn Fn(Vec<String>) + Send + Sync>;

struct Node {
  value: Vec<u8>,
  owner: Option<u64>,
  seq_counter: u64,
}

struct Watch {
  session: u64,
  path: String,
  cb: WatchCallback,
}

struct Job {
  cb: WatchCallback,
  children: Vec<String>,
}

#[derive(Default)]
struct State {
  nodes: BTreeMap<String, Node>,
  watches: Vec<Watch>,
  next_session: u64,
  live_sessions: HashSet<u64>,
}

struct Inner {
  state: Mutex<State>,
  notify_tx: mpsc::Sender<Job>,
}

/// Process-shared coordination store. Cloning the handle shares the
/// same state; each participant opens its own [`CoordSession`].
#[derive(Clone)]
pub struct CoordStore {
  inner: Arc<Inner>,
}

impl CoordStore {
  pub fn new() -> CoordStore {
    let (notify_tx, notify_rx) = mpsc::channel::<Job>();
    // All watch callbacks run on this one thread, in firing order.
    thread::Builder::new()
      .name("coord-notifier".to_string())
      .spawn(move || {
        for job in notify_rx {
          (job.cb)(job.children);
        }
        trace!("coord notifier drained, exiting");
      })
      .expect("spawning coord notifier");

    let mut state = State::default();
    state.nodes.insert(
      "/".to_string(),
      Node {
        value: Vec::new(),
        owner: None,
        seq_counter: 0,
      },
    );
    CoordStore {
      inner: Arc::new(Inner {
        state: Mutex::new(state),
        notify_tx,
      }),
    }
  }

  pub fn session(&self) -> CoordSession {
    let id = {
      let mut state = self.lock();
      state.next_session += 1;
      let id = state.next_session;
      state.live_sessions.insert(id);
      id
    };
    debug!("coord: opened session {id}");
    CoordSession {
      store: self.clone(),
      id,
      open: Arc::new(AtomicBool::new(true)),
    }
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, State> {
    self
      .inner
      .state
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  fn create(
    &self,
    session: u64,
    path: &str,
    value: &[u8],
    ephemeral: bool,
  ) -> Result<(), CoordError> {
    let jobs = {
      let mut state = self.lock();
      check_session(&state, session)?;
      if state.nodes.contains_key(path) {
        return Err(CoordError::AlreadyExists(path.to_string()));
      }
      ensure_ancestors(&mut state, path);
      state.nodes.insert(
        path.to_string(),
        Node {
          value: value.to_vec(),
          owner: ephemeral.then_some(session),
          seq_counter: 0,
        },
      );
      jobs_for(&state, &[parent_of(path).to_string()])
    };
    self.dispatch(jobs);
    Ok(())
  }

  fn create_sequential(
    &self,
    session: u64,
    parent: &str,
    prefix: &str,
    value: &[u8],
  ) -> Result<String, CoordError> {
    let (name, jobs) = {
      let mut state = self.lock();
      check_session(&state, session)?;
      ensure_ancestors(&mut state, parent);
      if !state.nodes.contains_key(parent) {
        state.nodes.insert(
          parent.to_string(),
          Node {
            value: Vec::new(),
            owner: None,
            seq_counter: 0,
          },
        );
      }
      let parent_node = state.nodes.get_mut(parent).expect("parent just ensured");
      let seq = parent_node.seq_counter;
      parent_node.seq_counter += 1;
      let name = format!("{prefix}{seq:010}");
      let path = join(parent, &name);
      state.nodes.insert(
        path,
        Node {
          value: value.to_vec(),
          owner: Some(session),
          seq_counter: 0,
        },
      );
      (name, jobs_for(&state, &[parent.to_string()]))
    };
    self.dispatch(jobs);
    Ok(name)
  }

  fn ensure_path(&self, session: u64, path: &str) -> Result<(), CoordError> {
    let jobs = {
      let mut state = self.lock();
      check_session(&state, session)?;
      if state.nodes.contains_key(path) {
        return Ok(());
      }
      ensure_ancestors(&mut state, path);
      state.nodes.insert(
        path.to_string(),
        Node {
          value: Vec::new(),
          owner: None,
          seq_counter: 0,
        },
      );
      jobs_for(&state, &[parent_of(path).to_string()])
    };
    self.dispatch(jobs);
    Ok(())
  }

  fn exists(&self, path: &str) -> bool {
    self.lock().nodes.contains_key(path)
  }

  fn get_data(&self, path: &str) -> Result<Vec<u8>, CoordError> {
    self
      .lock()
      .nodes
      .get(path)
      .map(|n| n.value.clone())
      .ok_or_else(|| CoordError::NoNode(path.to_string()))
  }

  fn children(&self, path: &str) -> Vec<String> {
    children_of(&self.lock(), path)
  }

  fn watch_children(
    &self,
    session: u64,
    path: &str,
    cb: WatchCallback,
  ) -> Result<(), CoordError> {
    let job = {
      let mut state = self.lock();
      check_session(&state, session)?;
      state.watches.push(Watch {
        session,
        path: path.to_string(),
        cb: Arc::clone(&cb),
      });
      // level-triggered: report the current children right away
      Job {
        cb,
        children: children_of(&state, path),
      }
    };
    self.dispatch(vec![job]);
    Ok(())
  }

  fn close_session(&self, session: u64) {
    let jobs = {
      let mut state = self.lock();
      if !state.live_sessions.remove(&session) {
        return;
      }
      let doomed: Vec<String> = state
        .nodes
        .iter()
        .filter(|(_, node)| node.owner == Some(session))
        .map(|(path, _)| path.clone())
        .collect();
      let mut touched: Vec<String> = Vec::new();
      for path in &doomed {
        state.nodes.remove(path);
        let parent = parent_of(path).to_string();
        if !touched.contains(&parent) {
          touched.push(parent);
        }
      }
      state.watches.retain(|w| w.session != session);
      jobs_for(&state, &touched)
    };
    debug!("coord: session {session} closed");
    self.dispatch(jobs);
  }

  fn dispatch(&self, jobs: Vec<Job>) {
    for job in jobs {
      if self.inner.notify_tx.send(job).is_err() {
        warn!("coord: notifier thread is gone");
      }
    }
  }
}

impl Default for CoordStore {
  fn default() -> Self {
    CoordStore::new()
  }
}

// ----------------------------------------------------------------------

/// A participant's handle to the store. Ephemeral nodes created through
/// a session live exactly as long as it does.
pub struct CoordSession {
  store: CoordStore,
  id: u64,
  open: Arc<AtomicBool>,
}

impl CoordSession {
  pub fn id(&self) -> u64 {
    self.id
  }

  /// Create an ephemeral node; fails with `AlreadyExists` if the path
  /// is taken. This race is the whole of leader election.
  pub fn create_ephemeral(&self, path: &str, value: &[u8]) -> Result<(), CoordError> {
    self.guard()?;
    self.store.create(self.id, path, value, true)
  }

  /// Create an ephemeral child of `parent` named `prefix` plus a
  /// store-assigned monotonic sequence; returns the assigned name.
  pub fn create_sequential_ephemeral(
    &self,
    parent: &str,
    prefix: &str,
    value: &[u8],
  ) -> Result<String, CoordError> {
    self.guard()?;
    self.store.create_sequential(self.id, parent, prefix, value)
  }

  /// Create a persistent path (and any missing ancestors).
  pub fn ensure_path(&self, path: &str) -> Result<(), CoordError> {
    self.guard()?;
    self.store.ensure_path(self.id, path)
  }

  pub fn exists(&self, path: &str) -> bool {
    self.store.exists(path)
  }

  pub fn get_data(&self, path: &str) -> Result<Vec<u8>, CoordError> {
    self.store.get_data(path)
  }

  pub fn children(&self, path: &str) -> Vec<String> {
    self.store.children(path)
  }

  /// Install a level-triggered children watch. The callback fires on
  /// the notifier thread with the full current child list, immediately
  /// on installation and after every change underneath `path`.
  pub fn watch_children(
    &self,
    path: &str,
    cb: impl Fn(Vec<String>) + Send + Sync + 'static,
  ) -> Result<(), CoordError> {
    self.guard()?;
    self.store.watch_children(self.id, path, Arc::new(cb))
  }

  /// End the session: ephemerals vanish, watches fire. Idempotent.
  pub fn close(&self) {
    if self.open.swap(false, Ordering::SeqCst) {
      self.store.close_session(self.id);
    }
  }

  fn guard(&self) -> Result<(), CoordError> {
    if self.open.load(Ordering::SeqCst) {
      Ok(())
    } else {
      Err(CoordError::SessionExpired)
    }
  }
}

impl Drop for CoordSession {
  fn drop(&mut self) {
    self.close();
  }
}

// ----------------------------------------------------------------------

fn check_session(state: &State, session: u64) -> Result<(), CoordError> {
  if state.live_sessions.contains(&session) {
    Ok(())
  } else {
    Err(CoordError::SessionExpired)
  }
}

fn parent_of(path: &str) -> &str {
  match path.rfind('/') {
    Some(0) => "/",
    Some(idx) => &path[..idx],
    None => "/",
  }
}

fn join(parent: &str, name: &str) -> String {
  if parent == "/" {
    format!("/{name}")
  } else {
    format!("{parent}/{name}")
  }
}

fn ensure_ancestors(state: &mut State, path: &str) {
  let mut ancestors = Vec::new();
  let mut cur = parent_of(path);
  while cur != "/" && !state.nodes.contains_key(cur) {
    ancestors.push(cur.to_string());
    cur = parent_of(cur);
  }
  for ancestor in ancestors.into_iter().rev() {
    state.nodes.insert(
      ancestor,
      Node {
        value: Vec::new(),
        owner: None,
        seq_counter: 0,
      },
    );
  }
}

fn children_of(state: &State, path: &str) -> Vec<String> {
  let prefix = if path == "/" {
    "/".to_string()
  } else {
    format!("{path}/")
  };
  state
    .nodes
    .keys()
    .filter_map(|k| {
      let rest = k.strip_prefix(&prefix)?;
      (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
    })
    .collect()
}

fn jobs_for(state: &State, touched: &[String]) -> Vec<Job> {
  state
    .watches
    .iter()
    .filter(|w| touched.iter().any(|t| *t == w.path))
    .map(|w| Job {
      cb: Arc::clone(&w.cb),
      children: children_of(state, &w.path),
    })
    .collect()
}
