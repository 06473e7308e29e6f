//! Remote function library
//!
//! Named PowerShell function bodies pushed into every session before the
//! first call. The bundled set is read once from a directory of `*.ps1`
//! files (the file stem is the function name); a provider may add or
//! replace functions by name.

use crate::error::ScvmmError;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// Silences every PowerShell stream except the output and error streams
const QUIET_PREFERENCES: &str = concat!(
    "$ProgressPreference = 'SilentlyContinue'\n",
    "$WarningPreference = 'SilentlyContinue'\n",
    "$VerbosePreference = 'SilentlyContinue'\n",
    "$InformationPreference = 'SilentlyContinue'\n",
    "$DebugPreference = 'SilentlyContinue'\n\n",
);

/// Read-only registry of remote function bodies
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionLibrary {
    functions: BTreeMap<String, String>,
}

impl FunctionLibrary {
    /// Load every `*.ps1` file in `dir`
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, ScvmmError> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir).map_err(|e| {
            ScvmmError::Library(format!("error scanning script dir {}: {e}", dir.display()))
        })?;

        let mut functions = BTreeMap::new();
        for entry in entries {
            let path = entry
                .map_err(|e| ScvmmError::Library(format!("error scanning script dir {}: {e}", dir.display())))?
                .path();
            if path.extension().and_then(|e| e.to_str()) != Some("ps1") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let body = std::fs::read_to_string(&path).map_err(|e| {
                ScvmmError::Library(format!("error reading script file {}: {e}", path.display()))
            })?;
            debug!("Loaded remote function {} from {}", name, path.display());
            functions.insert(name.to_string(), body);
        }
        Ok(Self { functions })
    }

    /// Build a library from in-memory function bodies
    pub fn from_functions<I, K, V>(functions: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            functions: functions
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Copy of this library with `overrides` taking precedence by name
    pub fn with_overrides(&self, overrides: &BTreeMap<String, String>) -> Self {
        let mut functions = self.functions.clone();
        functions.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self { functions }
    }

    /// Whether a function with a non-empty body is defined
    pub fn contains(&self, name: &str) -> bool {
        self.functions.get(name).is_some_and(|body| !body.trim().is_empty())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Script defining every function, preceded by the stream preferences
    pub fn preamble(&self) -> String {
        let mut script = String::from(QUIET_PREFERENCES);
        for (name, body) in &self.functions {
            script.push_str("function ");
            script.push_str(name);
            script.push_str(" {\n");
            script.push_str(body);
            if !body.ends_with('\n') {
                script.push('\n');
            }
            script.push_str("}\n\n");
        }
        script
    }
}
