// Named-secret resolution for sync handlers.
//
// Secrets resolve from the process environment first, then from the flat
// table in `<workbook>/.folio/secrets.toml`. Resolution reports every
// missing name, not just the first.

use std::collections::HashMap;
use std::path::Path;

use crate::config::secrets_path;

#[derive(Debug, Clone, Default)]
pub struct SecretStore {
    file_values: HashMap<String, String>,
}

impl SecretStore {
    /// Load the workbook's secrets file. A missing or unparsable file yields
    /// an empty store: the environment may still satisfy every name.
    pub fn load(workbook_dir: &Path) -> Self {
        let path = secrets_path(workbook_dir);
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(_) => return Self::default(),
        };
        match toml::from_str::<HashMap<String, String>>(&contents) {
            Ok(file_values) => Self { file_values },
            Err(error) => {
                tracing::warn!(path = %path.display(), %error, "ignoring unparsable secrets.toml");
                Self::default()
            }
        }
    }

    pub fn from_values(values: HashMap<String, String>) -> Self {
        Self { file_values: values }
    }

    /// Resolve all `names`. On failure the error lists every unresolvable
    /// name in request order.
    pub fn resolve(&self, names: &[String]) -> Result<HashMap<String, String>, Vec<String>> {
        let mut resolved = HashMap::with_capacity(names.len());
        let mut missing = Vec::new();

        for name in names {
            match self.lookup(name) {
                Some(value) => {
                    resolved.insert(name.clone(), value);
                }
                None => missing.push(name.clone()),
            }
        }

        if missing.is_empty() {
            Ok(resolved)
        } else {
            Err(missing)
        }
    }

    fn lookup(&self, name: &str) -> Option<String> {
        std::env::var(name).ok().or_else(|| self.file_values.get(name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn resolves_from_file_values() {
        let store = SecretStore::from_values(HashMap::from([(
            "HN_API_KEY".to_string(),
            "hunter2".to_string(),
        )]));
        let resolved = store.resolve(&["HN_API_KEY".to_string()]).unwrap();
        assert_eq!(resolved.get("HN_API_KEY").map(String::as_str), Some("hunter2"));
    }

    #[test]
    fn reports_every_missing_name_in_order() {
        let store = SecretStore::from_values(HashMap::from([(
            "PRESENT".to_string(),
            "yes".to_string(),
        )]));
        let names =
            vec!["GITHUB_TOKEN".to_string(), "PRESENT".to_string(), "SLACK_TOKEN".to_string()];
        let missing = store.resolve(&names).unwrap_err();
        assert_eq!(missing, vec!["GITHUB_TOKEN".to_string(), "SLACK_TOKEN".to_string()]);
    }

    #[test]
    fn environment_takes_precedence_over_file() {
        let store = SecretStore::from_values(HashMap::from([(
            "FOLIO_TEST_SECRET_PRECEDENCE".to_string(),
            "from-file".to_string(),
        )]));
        std::env::set_var("FOLIO_TEST_SECRET_PRECEDENCE", "from-env");
        let resolved =
            store.resolve(&["FOLIO_TEST_SECRET_PRECEDENCE".to_string()]).unwrap();
        assert_eq!(
            resolved.get("FOLIO_TEST_SECRET_PRECEDENCE").map(String::as_str),
            Some("from-env")
        );
        std::env::remove_var("FOLIO_TEST_SECRET_PRECEDENCE");
    }

    #[test]
    fn loads_flat_toml_table() {
        let dir = TempDir::new().unwrap();
        let config_dir = dir.path().join(".folio");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(config_dir.join("secrets.toml"), "API_KEY = \"abc123\"\n").unwrap();

        let store = SecretStore::load(dir.path());
        let resolved = store.resolve(&["API_KEY".to_string()]).unwrap();
        assert_eq!(resolved.get("API_KEY").map(String::as_str), Some("abc123"));
    }

    #[test]
    fn missing_file_yields_empty_store() {
        let dir = TempDir::new().unwrap();
        let store = SecretStore::load(dir.path());
        let missing = store.resolve(&["ANYTHING".to_string()]).unwrap_err();
        assert_eq!(missing, vec!["ANYTHING".to_string()]);
    }
}
