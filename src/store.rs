use crate::error::CrackError;
use crate::task::{Task, TaskStatus};
use rustc_hash::FxHashMap;

pub trait TaskStoreLike {
    /// Any task for `hash` whose status is not `ERROR`.
    fn find_active_by_hash(&mut self, hash: &str) -> Result<Option<Task>, CrackError>;
    fn find_by_request_id(&mut self, request_id: &str) -> Result<Option<Task>, CrackError>;
    fn find_waiting(&mut self) -> Result<Vec<Task>, CrackError>;
    fn insert(&mut self, task: &Task) -> Result<(), CrackError>;
    /// Moves the task to `status` only if it is currently in one of `expected`.
    /// Returns false when the task is missing or in another status.
    fn transition(
        &mut self,
        request_id: &str,
        expected: &[TaskStatus],
        status: TaskStatus,
        data: Option<&str>,
    ) -> Result<bool, CrackError>;
}

pub struct InMemoryTaskStore {
    pub map: FxHashMap<String, Task>,
    /// Makes every write fail, for exercising store-failure paths.
    pub fail_writes: bool,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self {
            map: FxHashMap::default(),
            fail_writes: false,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn check_writable(&self) -> Result<(), CrackError> {
        if self.fail_writes {
            return Err(CrackError::Store("store rejected the write".to_string()));
        }
        Ok(())
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskStoreLike for InMemoryTaskStore {
    fn find_active_by_hash(&mut self, hash: &str) -> Result<Option<Task>, CrackError> {
        Ok(self
            .map
            .values()
            .find(|task| task.hash == hash && task.status.is_active())
            .cloned())
    }

    fn find_by_request_id(&mut self, request_id: &str) -> Result<Option<Task>, CrackError> {
        Ok(self.map.get(request_id).cloned())
    }

    fn find_waiting(&mut self) -> Result<Vec<Task>, CrackError> {
        let mut waiting: Vec<Task> = self
            .map
            .values()
            .filter(|task| task.status == TaskStatus::Waiting)
            .cloned()
            .collect();
        waiting.sort_by(|a, b| a.request_id.cmp(&b.request_id));
        Ok(waiting)
    }

    fn insert(&mut self, task: &Task) -> Result<(), CrackError> {
        self.check_writable()?;
        if self.map.contains_key(&task.request_id) {
            return Err(CrackError::Store(format!(
                "duplicate key (hash, request_id) = ({}, {})",
                task.hash, task.request_id
            )));
        }
        self.map.insert(task.request_id.clone(), task.clone());
        Ok(())
    }

    fn transition(
        &mut self,
        request_id: &str,
        expected: &[TaskStatus],
        status: TaskStatus,
        data: Option<&str>,
    ) -> Result<bool, CrackError> {
        self.check_writable()?;
        match self.map.get_mut(request_id) {
            Some(task) if expected.contains(&task.status) => {
                task.status = status;
                if let Some(word) = data {
                    task.data = Some(word.to_string());
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
