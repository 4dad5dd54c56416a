// Parse, validate and manage module definitions.
//
// This module provides:
// 1. The immutable ModuleDefinition record and its builder
// 2. JSON parsing/serialization
// 3. Comprehensive validation (identity, dependencies, migrations, schema)
// 4. The declarative config schema checked against tenant configuration

use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::module_metadata::{
    CapabilityId, DependencySpec, LifecyclePolicy, MigrationSpec, ModuleId, ModulePermissions,
};

/// A capability the module provides, with its interface contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    pub id: CapabilityId,
    /// Interface contract identifier (e.g. "billing.invoice.v2")
    pub contract: String,
}

impl Capability {
    pub fn new(id: impl Into<String>, contract: impl Into<String>) -> Self {
        Self {
            id: CapabilityId::new(id.into()),
            contract: contract.into(),
        }
    }
}

/// Integration surface the module publishes when registered. Entries are
/// opaque identifiers interpreted by the host; the controller only tracks
/// their staging/live placement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntegrationSurface {
    pub routes: Vec<String>,
    pub apis: Vec<String>,
    pub components: Vec<String>,
}

impl IntegrationSurface {
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty() && self.apis.is_empty() && self.components.is_empty()
    }

    pub fn len(&self) -> usize {
        self.routes.len() + self.apis.len() + self.components.len()
    }
}

/// Value type accepted for a config field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
    Any,
}

impl FieldKind {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Integer => value.is_i64() || value.is_u64(),
            FieldKind::Number => value.is_number(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Object => value.is_object(),
            FieldKind::Array => value.is_array(),
            FieldKind::Any => true,
        }
    }
}

/// Declarative schema for a single dotted config key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
    /// Inclusive numeric lower bound
    #[serde(default)]
    pub min: Option<f64>,
    /// Inclusive numeric upper bound
    #[serde(default)]
    pub max: Option<f64>,
    /// Enum membership: the value must be one of these
    #[serde(default)]
    pub allowed: Option<Vec<Value>>,
}

impl FieldSchema {
    pub fn of(kind: FieldKind) -> Self {
        Self {
            kind,
            required: false,
            min: None,
            max: None,
            allowed: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub fn one_of(mut self, allowed: Vec<Value>) -> Self {
        self.allowed = Some(allowed);
        self
    }

    fn check(&self, key: &str, value: &Value) -> Result<(), String> {
        if !self.kind.accepts(value) {
            return Err(format!("key '{}' has wrong type, expected {:?}", key, self.kind));
        }
        if let Some(n) = value.as_f64() {
            if let Some(min) = self.min {
                if n < min {
                    return Err(format!("key '{}' value {} below minimum {}", key, n, min));
                }
            }
            if let Some(max) = self.max {
                if n > max {
                    return Err(format!("key '{}' value {} above maximum {}", key, n, max));
                }
            }
        }
        if let Some(allowed) = &self.allowed {
            if !allowed.contains(value) {
                return Err(format!("key '{}' value not in allowed set", key));
            }
        }
        Ok(())
    }
}

/// Typed schema for tenant configuration, keyed by dotted path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigSchema {
    pub fields: HashMap<String, FieldSchema>,
}

impl ConfigSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, key: impl Into<String>, schema: FieldSchema) -> Self {
        self.fields.insert(key.into(), schema);
        self
    }

    /// Check a single key/value write against the schema. Keys the schema
    /// does not mention are accepted as-is.
    pub fn check_write(&self, key: &str, value: &Value) -> Result<(), String> {
        match self.fields.get(key) {
            Some(field) => field.check(key, value),
            None => Ok(()),
        }
    }

    /// Check a complete flattened config map, including required keys.
    pub fn check_all(&self, flat: &HashMap<String, Value>) -> Vec<String> {
        let mut problems = Vec::new();
        for (key, field) in &self.fields {
            match flat.get(key) {
                Some(value) => {
                    if let Err(e) = field.check(key, value) {
                        problems.push(e);
                    }
                }
                None if field.required => {
                    problems.push(format!("required key '{}' is missing", key));
                }
                None => {}
            }
        }
        problems
    }
}

/// Immutable definition of a module version. Created externally, installed
/// into the registry, never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDefinition {
    pub id: ModuleId,
    pub version: Version,
    /// Capabilities this module provides
    pub capabilities: Vec<Capability>,
    /// Declared dependencies, in declaration order
    pub dependencies: Vec<DependencySpec>,
    /// Modules this one cannot coexist with in a tenant scope
    pub conflicts: Vec<ModuleId>,
    pub integration: IntegrationSurface,
    pub config_schema: ConfigSchema,
    pub lifecycle: LifecyclePolicy,
    pub permissions: ModulePermissions,
    /// Schema/data migrations shipped with this version
    pub migrations: Vec<MigrationSpec>,
    /// Ranking weight when several providers satisfy the same dependency
    pub provider_priority: i32,
    pub metadata: serde_json::Map<String, Value>,
}

impl ModuleDefinition {
    pub fn builder(id: impl Into<ModuleId>, version: Version) -> ModuleDefinitionBuilder {
        ModuleDefinitionBuilder::new(id, version)
    }

    pub fn provides(&self, capability: &CapabilityId) -> bool {
        self.capabilities.iter().any(|c| &c.id == capability)
    }

    /// Key under which this definition is persisted.
    pub fn storage_key(&self) -> String {
        format!("modules/{}/{}", self.id, self.version)
    }
}

/// Builder for module definitions.
pub struct ModuleDefinitionBuilder {
    definition: ModuleDefinition,
}

impl ModuleDefinitionBuilder {
    pub fn new(id: impl Into<ModuleId>, version: Version) -> Self {
        Self {
            definition: ModuleDefinition {
                id: id.into(),
                version,
                capabilities: Vec::new(),
                dependencies: Vec::new(),
                conflicts: Vec::new(),
                integration: IntegrationSurface::default(),
                config_schema: ConfigSchema::default(),
                lifecycle: LifecyclePolicy::default(),
                permissions: ModulePermissions::default(),
                migrations: Vec::new(),
                provider_priority: 0,
                metadata: serde_json::Map::new(),
            },
        }
    }

    pub fn capability(mut self, id: impl Into<String>, contract: impl Into<String>) -> Self {
        self.definition.capabilities.push(Capability::new(id, contract));
        self
    }

    pub fn dependency(mut self, spec: DependencySpec) -> Self {
        self.definition.dependencies.push(spec);
        self
    }

    pub fn conflicts_with(mut self, id: impl Into<ModuleId>) -> Self {
        self.definition.conflicts.push(id.into());
        self
    }

    pub fn integration(mut self, surface: IntegrationSurface) -> Self {
        self.definition.integration = surface;
        self
    }

    pub fn route(mut self, route: impl Into<String>) -> Self {
        self.definition.integration.routes.push(route.into());
        self
    }

    pub fn config_schema(mut self, schema: ConfigSchema) -> Self {
        self.definition.config_schema = schema;
        self
    }

    pub fn lifecycle(mut self, lifecycle: LifecyclePolicy) -> Self {
        self.definition.lifecycle = lifecycle;
        self
    }

    pub fn permissions(mut self, permissions: ModulePermissions) -> Self {
        self.definition.permissions = permissions;
        self
    }

    pub fn migration(mut self, migration: MigrationSpec) -> Self {
        self.definition.migrations.push(migration);
        self
    }

    pub fn provider_priority(mut self, priority: i32) -> Self {
        self.definition.provider_priority = priority;
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.definition.metadata.insert(key.into(), value);
        self
    }

    pub fn build(self) -> ModuleDefinition {
        self.definition
    }
}

/// Validation result with detailed errors and warnings.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<DefinitionError>,
    pub warnings: Vec<DefinitionWarning>,
}

impl ValidationResult {
    pub fn valid() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn add_error(&mut self, error: DefinitionError) {
        self.valid = false;
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: DefinitionWarning) {
        self.warnings.push(warning);
    }

    pub fn merge(&mut self, other: ValidationResult) {
        if !other.valid {
            self.valid = false;
        }
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

/// Validation error types.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DefinitionError {
    #[error("Module id cannot be empty")]
    EmptyModuleId,

    #[error("Invalid module id format: {0}")]
    InvalidModuleId(String),

    #[error("Duplicate capability id: {0}")]
    DuplicateCapability(String),

    #[error("Duplicate dependency on module: {0}")]
    DuplicateDependency(String),

    #[error("Module {0} depends on itself")]
    SelfDependency(String),

    #[error("Module {module} both depends on and conflicts with {other}")]
    ConflictingDependency { module: String, other: String },

    #[error("Non-additive migration rejected: {0}")]
    NonAdditiveMigration(String),

    #[error("Duplicate migration version: {0}")]
    DuplicateMigration(String),

    #[error("Invalid config schema for key {key}: {reason}")]
    InvalidSchema { key: String, reason: String },

    #[error("Invalid lifecycle policy: {0}")]
    InvalidLifecycle(String),
}

/// Validation warning types.
#[derive(Debug, Clone, PartialEq)]
pub enum DefinitionWarning {
    NoCapabilities,
    LargeIntegrationSurface { entries: usize },
    ManyDependencies { count: usize },
    ZeroActivationTimeout,
}

/// Comprehensive definition validator.
pub struct DefinitionValidator {
    max_dependencies: usize,
    max_surface_entries: usize,
}

impl DefinitionValidator {
    pub fn new() -> Self {
        Self {
            max_dependencies: 32,
            max_surface_entries: 256,
        }
    }

    pub fn with_max_dependencies(mut self, max: usize) -> Self {
        self.max_dependencies = max;
        self
    }

    pub fn validate(&self, definition: &ModuleDefinition) -> ValidationResult {
        let mut result = ValidationResult::valid();

        self.validate_identity(definition, &mut result);
        self.validate_capabilities(definition, &mut result);
        self.validate_dependencies(definition, &mut result);
        self.validate_migrations(definition, &mut result);
        self.validate_schema(definition, &mut result);
        self.validate_lifecycle(definition, &mut result);

        result
    }

    fn validate_identity(&self, definition: &ModuleDefinition, result: &mut ValidationResult) {
        let id = definition.id.as_str();
        if id.is_empty() {
            result.add_error(DefinitionError::EmptyModuleId);
            return;
        }
        // Ids take part in storage keys and namespace paths, so slashes and
        // whitespace are out.
        if id.contains('/') || id.contains(char::is_whitespace) {
            result.add_error(DefinitionError::InvalidModuleId(id.to_string()));
        }
    }

    fn validate_capabilities(&self, definition: &ModuleDefinition, result: &mut ValidationResult) {
        if definition.capabilities.is_empty() && definition.integration.is_empty() {
            result.add_warning(DefinitionWarning::NoCapabilities);
        }

        let mut seen = HashSet::new();
        for capability in &definition.capabilities {
            if !seen.insert(capability.id.as_str().to_string()) {
                result.add_error(DefinitionError::DuplicateCapability(
                    capability.id.as_str().to_string(),
                ));
            }
        }

        if definition.integration.len() > self.max_surface_entries {
            result.add_warning(DefinitionWarning::LargeIntegrationSurface {
                entries: definition.integration.len(),
            });
        }
    }

    fn validate_dependencies(&self, definition: &ModuleDefinition, result: &mut ValidationResult) {
        let mut seen = HashSet::new();
        for dep in &definition.dependencies {
            if dep.id == definition.id {
                result.add_error(DefinitionError::SelfDependency(definition.id.to_string()));
            }
            if !seen.insert(dep.id.clone()) {
                result.add_error(DefinitionError::DuplicateDependency(dep.id.to_string()));
            }
            if definition.conflicts.contains(&dep.id) {
                result.add_error(DefinitionError::ConflictingDependency {
                    module: definition.id.to_string(),
                    other: dep.id.to_string(),
                });
            }
        }

        if definition.dependencies.len() > self.max_dependencies {
            result.add_warning(DefinitionWarning::ManyDependencies {
                count: definition.dependencies.len(),
            });
        }
    }

    fn validate_migrations(&self, definition: &ModuleDefinition, result: &mut ValidationResult) {
        let mut seen = HashSet::new();
        for migration in &definition.migrations {
            if !migration.additive {
                result.add_error(DefinitionError::NonAdditiveMigration(
                    migration.version.clone(),
                ));
            }
            if !seen.insert(migration.version.clone()) {
                result.add_error(DefinitionError::DuplicateMigration(migration.version.clone()));
            }
        }
    }

    fn validate_schema(&self, definition: &ModuleDefinition, result: &mut ValidationResult) {
        for (key, field) in &definition.config_schema.fields {
            if key.is_empty() {
                result.add_error(DefinitionError::InvalidSchema {
                    key: key.clone(),
                    reason: "empty key".to_string(),
                });
            }
            if let (Some(min), Some(max)) = (field.min, field.max) {
                if min > max {
                    result.add_error(DefinitionError::InvalidSchema {
                        key: key.clone(),
                        reason: format!("min {} greater than max {}", min, max),
                    });
                }
            }
            if let Some(allowed) = &field.allowed {
                if allowed.is_empty() {
                    result.add_error(DefinitionError::InvalidSchema {
                        key: key.clone(),
                        reason: "empty allowed set".to_string(),
                    });
                }
            }
        }
    }

    fn validate_lifecycle(&self, definition: &ModuleDefinition, result: &mut ValidationResult) {
        if definition.lifecycle.activation_timeout_ms == 0 {
            result.add_warning(DefinitionWarning::ZeroActivationTimeout);
        }
        if definition.lifecycle.verification_passes == 0 {
            result.add_error(DefinitionError::InvalidLifecycle(
                "verification_passes must be at least 1".to_string(),
            ));
        }
    }
}

impl Default for DefinitionValidator {
    fn default() -> Self {
        Self::new()
    }
}

/// JSON parsing and serialization for definitions.
pub struct DefinitionParser;

impl DefinitionParser {
    pub fn from_json(json: &str) -> Result<ModuleDefinition, ParseError> {
        serde_json::from_str(json).map_err(|e| ParseError::Json(e.to_string()))
    }

    pub fn from_json_bytes(bytes: &[u8]) -> Result<ModuleDefinition, ParseError> {
        serde_json::from_slice(bytes).map_err(|e| ParseError::Json(e.to_string()))
    }

    pub fn to_json(definition: &ModuleDefinition) -> Result<String, ParseError> {
        serde_json::to_string_pretty(definition).map_err(|e| ParseError::Serialization(e.to_string()))
    }

    pub fn to_json_bytes(definition: &ModuleDefinition) -> Result<Vec<u8>, ParseError> {
        serde_json::to_vec(definition).map_err(|e| ParseError::Serialization(e.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("JSON parse error: {0}")]
    Json(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}
