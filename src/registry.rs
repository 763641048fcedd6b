//! Operation registry: the per-language catalog of registered operations.
//!
//! Languages register a batch of declarations plus their handler functions
//! at load time; lookups afterwards are read-only. Re-registering a language
//! replaces its whole table, which makes registration idempotent under
//! grammar reloads.

use crate::types::{OperationDeclaration, OperationHandler, RegisteredOperation};
use std::collections::HashMap;
use std::sync::RwLock;

/// What happened during one `register_language` call.
#[derive(Debug, Clone, Default)]
pub struct RegistrationSummary {
    /// Operation ids bound to a handler.
    pub registered: Vec<String>,
    /// Declared operations with no matching handler; absent from lookups.
    pub skipped: Vec<String>,
}

/// Registry mapping `(language id, operation id)` to registered operations.
///
/// Thread-safe for use across async tasks.
pub struct OperationRegistry {
    languages: RwLock<HashMap<String, HashMap<String, RegisteredOperation>>>,
}

impl OperationRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            languages: RwLock::new(HashMap::new()),
        }
    }

    /// Register a language's operations, binding each declaration to the
    /// handler of the same id.
    ///
    /// Declarations without a handler are recorded as skipped rather than
    /// treated as errors. Any previous table for the language is replaced.
    pub fn register_language(
        &self,
        language_id: &str,
        declarations: Vec<OperationDeclaration>,
        mut handlers: HashMap<String, OperationHandler>,
    ) -> RegistrationSummary {
        let mut summary = RegistrationSummary::default();
        let mut table = HashMap::new();

        for declaration in declarations {
            let operation_id = declaration.id.clone();
            match handlers.remove(&operation_id) {
                Some(handler) => {
                    table.insert(
                        operation_id.clone(),
                        RegisteredOperation {
                            declaration,
                            handler,
                            language_id: language_id.to_string(),
                        },
                    );
                    summary.registered.push(operation_id);
                }
                None => {
                    tracing::warn!(
                        "no handler for declared operation '{}' in language '{}', skipping",
                        operation_id,
                        language_id
                    );
                    summary.skipped.push(operation_id);
                }
            }
        }

        tracing::info!(
            "registered {} operation(s) for language '{}' ({} skipped)",
            summary.registered.len(),
            language_id,
            summary.skipped.len()
        );

        self.languages
            .write()
            .unwrap()
            .insert(language_id.to_string(), table);

        summary
    }

    /// Look up one registered operation.
    pub fn get_operation(&self, language_id: &str, operation_id: &str) -> Option<RegisteredOperation> {
        self.languages
            .read()
            .unwrap()
            .get(language_id)
            .and_then(|table| table.get(operation_id))
            .cloned()
    }

    /// All operations of a language whose declared target types intersect
    /// `types` (wildcard declarations always match).
    pub fn find_operations_for_types(
        &self,
        language_id: &str,
        types: &[&str],
    ) -> Vec<RegisteredOperation> {
        let languages = self.languages.read().unwrap();
        let Some(table) = languages.get(language_id) else {
            return Vec::new();
        };

        let mut operations: Vec<RegisteredOperation> = table
            .values()
            .filter(|op| op.declaration.target_types.intersects(types))
            .cloned()
            .collect();
        operations.sort_by(|a, b| a.declaration.id.cmp(&b.declaration.id));
        operations
    }

    /// Declarations registered for a language, for catalog listings.
    pub fn operations_for_language(&self, language_id: &str) -> Vec<OperationDeclaration> {
        let languages = self.languages.read().unwrap();
        let Some(table) = languages.get(language_id) else {
            return Vec::new();
        };

        let mut declarations: Vec<OperationDeclaration> =
            table.values().map(|op| op.declaration.clone()).collect();
        declarations.sort_by(|a, b| a.id.cmp(&b.id));
        declarations
    }

    /// Languages with at least one registered operation.
    pub fn language_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.languages.read().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Total number of registered operations across all languages.
    pub fn operation_count(&self) -> usize {
        self.languages
            .read()
            .unwrap()
            .values()
            .map(|table| table.len())
            .sum()
    }
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new()
    }
}
