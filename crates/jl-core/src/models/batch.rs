use crate::error::ClusterError;

/// One item of a batch operation that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    pub item: String,
    pub error: String,
}

/// Per-item outcomes of an operation applied to many resources.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOutcome<T> {
    pub succeeded: Vec<T>,
    pub failed: Vec<ItemFailure>,
}

impl<T> Default for BatchOutcome<T> {
    fn default() -> Self {
        Self {
            succeeded: Vec::new(),
            failed: Vec::new(),
        }
    }
}

impl<T> BatchOutcome<T> {
    pub fn record_failure(&mut self, item: impl Into<String>, error: impl ToString) {
        self.failed.push(ItemFailure {
            item: item.into(),
            error: error.to_string(),
        });
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Collapse into `PartialFailure` if anything failed.
    pub fn into_result(self) -> Result<Vec<T>, ClusterError> {
        if self.failed.is_empty() {
            return Ok(self.succeeded);
        }
        let summary = self
            .failed
            .iter()
            .map(|f| format!("{}: {}", f.item, f.error))
            .collect::<Vec<_>>()
            .join("; ");
        Err(ClusterError::PartialFailure {
            total: self.succeeded.len() + self.failed.len(),
            failed: self.failed.len(),
            summary,
        })
    }
}
