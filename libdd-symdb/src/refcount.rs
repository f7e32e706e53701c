// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::SymdbError;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;

struct State<T> {
    refs: usize,
    value: Option<Arc<T>>,
}

/// A lazily loaded value shared by counted handles: the value is loaded
/// when the count goes from 0 to 1 and dropped when it goes back to 0.
///
/// The lock is held while loading, so concurrent acquirers wait for the
/// first one instead of loading the value again. A failed or cancelled load
/// leaves the count untouched.
pub(crate) struct RefCounted<T> {
    state: Mutex<State<T>>,
}

impl<T> Default for RefCounted<T> {
    fn default() -> Self {
        Self {
            state: Mutex::new(State {
                refs: 0,
                value: None,
            }),
        }
    }
}

impl<T> RefCounted<T> {
    pub(crate) async fn acquire<F, Fut>(&self, load: F) -> Result<Arc<T>, SymdbError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SymdbError>>,
    {
        let mut state = self.state.lock().await;
        let value = match &state.value {
            Some(value) => value.clone(),
            None => {
                let value = Arc::new(load().await?);
                state.value = Some(value.clone());
                value
            }
        };
        state.refs += 1;
        Ok(value)
    }

    pub(crate) async fn release(&self) {
        let mut state = self.state.lock().await;
        match state.refs {
            0 => {}
            1 => {
                state.refs = 0;
                state.value = None;
            }
            _ => state.refs -= 1,
        }
    }

    #[cfg(test)]
    pub(crate) async fn refs(&self) -> usize {
        self.state.lock().await.refs
    }

    #[cfg(test)]
    pub(crate) async fn is_loaded(&self) -> bool {
        self.state.lock().await.value.is_some()
    }
}
