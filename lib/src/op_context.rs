// Copyright 2024 The Zeta Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Cooperative cancellation for long-running operations.
//!
//! Every long-running entry point takes an [`OpContext`] and polls it at loop
//! heads and between object reads. Pure CPU work is not preempted. Cloning
//! shares the underlying flag, so cancelling one clone cancels all in-flight
//! work spawned from it.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Instant;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CancelledError {
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Operation deadline exceeded")]
    DeadlineExceeded,
}

/// Carries the cancellation signal and optional deadline for one operation.
#[derive(Debug, Clone)]
pub struct OpContext {
    cancelled: Arc<AtomicBool>,
    /// Flags of enclosing contexts; cancelling any of them cancels this
    /// one, but not the other way around.
    linked: Vec<Arc<AtomicBool>>,
    deadline: Option<Instant>,
}

impl OpContext {
    /// A context that never cancels. The core imposes no default timeouts.
    pub fn background() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            linked: Vec::new(),
            deadline: None,
        }
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            linked: Vec::new(),
            deadline: None,
        }
        .deadline_at(deadline)
    }

    fn deadline_at(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// A context that cancels when `self` cancels, with its own
    /// independently cancellable flag. The transfer loop uses this to
    /// abort sibling streams without poisoning the caller's context.
    pub fn child(&self) -> Self {
        let mut linked = self.linked.clone();
        linked.push(self.cancelled.clone());
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            linked,
            deadline: self.deadline,
        }
    }

    /// Requests cancellation of this context and its children.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.check().is_err()
    }

    /// Returns an error if the operation should stop. Call at loop heads.
    pub fn check(&self) -> Result<(), CancelledError> {
        if self.cancelled.load(Ordering::Acquire)
            || self.linked.iter().any(|flag| flag.load(Ordering::Acquire))
        {
            Err(CancelledError::Cancelled)
        } else if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            Err(CancelledError::DeadlineExceeded)
        } else {
            Ok(())
        }
    }
}
