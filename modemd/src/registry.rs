use crate::{
    error::{Error, Result},
    session::ModemSession,
    transport::TransportHandle,
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

/// A registered session behind its own lock.
#[derive(Debug)]
pub struct SessionCell {
    path: String,
    session: Mutex<ModemSession>,
}

impl SessionCell {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Never held across an await.
    pub fn lock(&self) -> MutexGuard<'_, ModemSession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Sessions keyed by device path.
///
/// The registry lock only guards membership. Session state is behind each
/// [`SessionCell`], and the registry lock is never held while a cell is locked.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    sessions: Mutex<HashMap<String, Arc<SessionCell>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<SessionCell>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, session: ModemSession) -> Result<Arc<SessionCell>> {
        let path = session.path().to_string();
        let mut sessions = self.sessions();
        if sessions.contains_key(&path) {
            return Err(Error::AlreadyExists(path));
        }

        let cell = Arc::new(SessionCell {
            path: path.clone(),
            session: Mutex::new(session),
        });
        sessions.insert(path, Arc::clone(&cell));

        Ok(cell)
    }

    pub fn remove(&self, path: &str) -> Option<Arc<SessionCell>> {
        self.sessions().remove(path)
    }

    pub fn get(&self, path: &str) -> Option<Arc<SessionCell>> {
        self.sessions().get(path).cloned()
    }

    /// Whether this exact cell is still registered, as opposed to a newer session
    /// under the same path.
    pub fn contains(&self, cell: &Arc<SessionCell>) -> bool {
        self.sessions()
            .get(cell.path())
            .is_some_and(|registered| Arc::ptr_eq(registered, cell))
    }

    pub fn all(&self) -> Vec<Arc<SessionCell>> {
        self.sessions().values().cloned().collect()
    }

    pub fn drain(&self) -> Vec<Arc<SessionCell>> {
        self.sessions().drain().map(|(_, cell)| cell).collect()
    }

    /// Sessions waiting to be opened.
    pub fn pending(&self) -> Vec<Arc<SessionCell>> {
        self.all()
            .into_iter()
            .filter(|cell| cell.lock().is_pending())
            .collect()
    }

    pub fn find_by_handle(&self, handle: &TransportHandle) -> Option<Arc<SessionCell>> {
        self.all()
            .into_iter()
            .find(|cell| cell.lock().handle() == Some(handle))
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }
}
