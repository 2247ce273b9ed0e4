use regex::Regex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::CredentialError;

pub const API_KEY_NAMES: [&str; 2] = ["PLANET_API_KEY", "planet_api_key"];

pub trait SecretProvider {
    fn api_key(&self) -> Result<String, CredentialError>;
}

/// Looks in the process environment first, then in a `.env`-style file.
pub struct EnvSecret {
    env_file: PathBuf,
    names: Vec<String>,
}

impl EnvSecret {
    pub fn new<P: AsRef<Path>>(env_file: P) -> Self {
        Self::with_names(env_file, &API_KEY_NAMES)
    }

    pub fn with_names<P: AsRef<Path>>(env_file: P, names: &[&str]) -> Self {
        Self {
            env_file: env_file.as_ref().to_path_buf(),
            names: names.iter().map(|n| n.to_string()).collect(),
        }
    }
}

impl SecretProvider for EnvSecret {
    fn api_key(&self) -> Result<String, CredentialError> {
        for name in self.names.iter() {
            if let Ok(value) = std::env::var(name) {
                if !value.trim().is_empty() {
                    return Ok(value.trim().to_string());
                }
            }
        }

        if self.env_file.exists() {
            let content = fs::read_to_string(&self.env_file).map_err(|source| CredentialError::Io {
                path: self.env_file.clone(),
                source,
            })?;
            let vars = parse_env_file(&content);
            for name in self.names.iter() {
                if let Some(value) = vars.get(name).filter(|v| !v.is_empty()) {
                    return Ok(value.clone());
                }
            }
        }

        Err(CredentialError::Missing(self.env_file.display().to_string()))
    }
}

/// `KEY=value` lines with optional `export ` prefix, quotes and `#` comments.
pub fn parse_env_file(content: &str) -> HashMap<String, String> {
    let re = Regex::new(r"^\s*(?:export\s+)?([A-Za-z_][A-Za-z0-9_]*)\s*=\s*(.*?)\s*$")
        .expect("Regex pattern should always compile");

    content
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .filter_map(|line| {
            let captures = re.captures(line)?;
            let (_, [key, raw]) = captures.extract();
            Some((key.to_string(), unquote(raw)))
        })
        .collect()
}

fn unquote(raw: &str) -> String {
    for quote in ['"', '\''] {
        if raw.len() >= 2 && raw.starts_with(quote) && raw.ends_with(quote) {
            return raw[1..raw.len() - 1].to_string();
        }
    }
    match raw.find(" #") {
        Some(idx) => raw[..idx].trim_end().to_string(),
        None => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_file() {
        let vars = parse_env_file(
            "# planet credentials\n\
             planet_api_key=PLAK123\n\
             export OTHER = \"quoted value\"\n\
             SINGLE='x y'\n\
             TRAILING=abc # comment\n\
             not a line\n",
        );
        assert_eq!(vars["planet_api_key"], "PLAK123");
        assert_eq!(vars["OTHER"], "quoted value");
        assert_eq!(vars["SINGLE"], "x y");
        assert_eq!(vars["TRAILING"], "abc");
        assert_eq!(vars.len(), 4);
    }

    #[test]
    fn test_reads_from_env_file() {
        let dir = tempfile::tempdir().unwrap();
        let env_file = dir.path().join(".env");
        fs::write(&env_file, "PLANET_FETCH_TEST_FILE_KEY=from-file\n").unwrap();
        let secret = EnvSecret::with_names(&env_file, &["PLANET_FETCH_TEST_FILE_KEY"]);
        assert_eq!(secret.api_key().unwrap(), "from-file");
    }

    #[test]
    fn test_environment_wins_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let env_file = dir.path().join(".env");
        fs::write(&env_file, "PLANET_FETCH_TEST_ENV_KEY=from-file\n").unwrap();
        std::env::set_var("PLANET_FETCH_TEST_ENV_KEY", "from-env");
        let secret = EnvSecret::with_names(&env_file, &["PLANET_FETCH_TEST_ENV_KEY"]);
        assert_eq!(secret.api_key().unwrap(), "from-env");
        std::env::remove_var("PLANET_FETCH_TEST_ENV_KEY");
    }

    #[test]
    fn test_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let env_file = dir.path().join(".env");
        fs::write(&env_file, "PLANET_FETCH_TEST_MISSING_KEY=\n").unwrap();
        let secret = EnvSecret::with_names(&env_file, &["PLANET_FETCH_TEST_MISSING_KEY"]);
        assert!(matches!(secret.api_key(), Err(CredentialError::Missing(_))));
    }
}
