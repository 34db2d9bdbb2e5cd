//! Single-flight request coalescing.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use futures::future::{BoxFuture, FutureExt, Shared};

struct Flight<K, T> {
    key: K,
    generation: u64,
    future: Shared<BoxFuture<'static, T>>,
}

/// Runs at most one operation at a time.
///
/// Callers with the key of the in-flight operation join it and receive a
/// clone of its result. Callers with any other key wait for it to settle
/// and then start their own.
pub struct SingleFlight<K, T: Clone> {
    slot: Mutex<Option<Flight<K, T>>>,
    generation: AtomicU64,
}

impl<K, T: Clone> Default for SingleFlight<K, T> {
    fn default() -> Self {
        Self {
            slot: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }
}

impl<K, T> SingleFlight<K, T>
where
    K: Eq + Clone,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `make()` under `key`, or join the in-flight run for `key`.
    ///
    /// The operation keeps running if the caller that started it is dropped;
    /// any joined caller drives it to completion.
    pub async fn run<F, Fut>(&self, key: K, make: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let mut make = Some(make);
        loop {
            let (future, generation, ours) = {
                let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
                match slot.as_ref() {
                    Some(flight) => (
                        flight.future.clone(),
                        flight.generation,
                        flight.key == key,
                    ),
                    None => {
                        let Some(make) = make.take() else {
                            unreachable!("operation is started at most once per call")
                        };
                        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                        let future = make().boxed().shared();
                        *slot = Some(Flight {
                            key: key.clone(),
                            generation,
                            future: future.clone(),
                        });
                        (future, generation, true)
                    }
                }
            };

            let output = future.await;
            self.finish(generation);
            if ours {
                return output;
            }
        }
    }

    /// Whether an operation is in flight.
    pub fn is_busy(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn finish(&self, generation: u64) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|f| f.generation == generation) {
            *slot = None;
        }
    }
}
