//! Migration unit definitions.

use sha2::{Digest, Sha256};

use crate::operation::Operation;
use crate::sql::object_key;

/// One ordered, atomic step of the schema evolution sequence.
///
/// Units are built once (by the catalog loader or in code) and never
/// modified afterwards; all accessors borrow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationUnit {
    ordinal: u32,
    name: String,
    description: Option<String>,
    operations: Vec<Operation>,
    requires: Vec<String>,
    creates: Vec<String>,
    irreversible: bool,
}

impl MigrationUnit {
    /// Create an empty unit with the given ordinal and stable name.
    pub fn new(ordinal: u32, name: impl Into<String>) -> Self {
        Self {
            ordinal,
            name: name.into(),
            description: None,
            operations: Vec::new(),
            requires: Vec::new(),
            creates: Vec::new(),
            irreversible: false,
        }
    }

    /// Add a forward operation. Objects it creates are declared automatically.
    pub fn with_operation(mut self, operation: Operation) -> Self {
        if let Some(object) = operation.created_object() {
            let object = object.to_string();
            self = self.creates(object);
        }
        self.operations.push(operation);
        self
    }

    /// Declare an object that must exist before this unit runs.
    pub fn requires(mut self, object: impl Into<String>) -> Self {
        let object = object.into();
        if !self.requires.iter().any(|o| object_key(o) == object_key(&object)) {
            self.requires.push(object);
        }
        self
    }

    /// Declare an object this unit creates.
    pub fn creates(mut self, object: impl Into<String>) -> Self {
        let object = object.into();
        if !self.creates.iter().any(|o| object_key(o) == object_key(&object)) {
            self.creates.push(object);
        }
        self
    }

    /// Flag the unit as impossible to undo.
    pub fn irreversible(mut self) -> Self {
        self.irreversible = true;
        self
    }

    /// Attach a human-readable description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Position of the unit in the catalog.
    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    /// Stable identity.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Optional description.
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Forward operations in execution order.
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Objects that must pre-exist.
    pub fn required_objects(&self) -> &[String] {
        &self.requires
    }

    /// Objects this unit creates.
    pub fn created_objects(&self) -> &[String] {
        &self.creates
    }

    /// Whether the author flagged the unit irreversible.
    pub fn is_irreversible(&self) -> bool {
        self.irreversible
    }

    /// Hex SHA-256 over the unit's statements.
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        for op in &self.operations {
            hasher.update(op.sql.trim().as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }

    /// Inverse statements in undo order, and descriptions of operations
    /// that have no inverse.
    pub fn inverse_script(&self) -> (Vec<String>, Vec<String>) {
        let mut statements = Vec::new();
        let mut missing = Vec::new();
        for op in self.operations.iter().rev() {
            match op.inverse() {
                Some(sql) => statements.push(sql),
                None => missing.push(op.describe()),
            }
        }
        (statements, missing)
    }

    /// Tables whose row counts are captured in checkpoints.
    pub fn touched_tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = Vec::new();
        for op in &self.operations {
            for table in op.touched_tables() {
                if !tables.iter().any(|t| object_key(t) == object_key(table)) {
                    tables.push(table.to_string());
                }
            }
        }
        tables
    }
}

impl std::fmt::Display for MigrationUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (#{})", self.name, self.ordinal)
    }
}
