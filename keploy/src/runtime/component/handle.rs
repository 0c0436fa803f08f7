use tokio::task::JoinHandle;

/// A handle to one registered session component.
pub struct Handle {
    name: String,
    join: JoinHandle<()>,
}

impl Handle {
    pub fn new(name: impl Into<String>, join: JoinHandle<()>) -> Self {
        Self {
            name: name.into(),
            join,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(super) fn into_join(self) -> (String, JoinHandle<()>) {
        (self.name, self.join)
    }
}
