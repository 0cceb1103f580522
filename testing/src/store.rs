//! In-memory prescription store.

use pharmonico_core::prescription::{Prescription, PrescriptionStore, StoreError, StoreFuture};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Prescription store backed by a `HashMap`. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPrescriptionStore {
    documents: Arc<Mutex<HashMap<String, Prescription>>>,
    fail_saves: Arc<AtomicBool>,
    saves: Arc<AtomicUsize>,
}

impl InMemoryPrescriptionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a document without counting it as a save.
    pub fn insert(&self, prescription: Prescription) {
        self.lock().insert(prescription.id.clone(), prescription);
    }

    /// Current document for `id`.
    #[must_use]
    pub fn snapshot(&self, id: &str) -> Option<Prescription> {
        self.lock().get(id).cloned()
    }

    /// Number of stored documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of successful `save` calls.
    #[must_use]
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Make `save` fail with a database error.
    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Prescription>> {
        self.documents.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PrescriptionStore for InMemoryPrescriptionStore {
    fn save<'a>(&'a self, prescription: &'a Prescription) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            if self.fail_saves.load(Ordering::SeqCst) {
                return Err(StoreError::Database("injected save failure".to_string()));
            }
            self.lock().insert(prescription.id.clone(), prescription.clone());
            self.saves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn get<'a>(&'a self, id: &'a str) -> StoreFuture<'a, Option<Prescription>> {
        Box::pin(async move { Ok(self.lock().get(id).cloned()) })
    }
}
