// src/protocol/environment.rs
//! Runtime environment identifiers.
//!
//! An environment is either the ambient interpreter (`$system`) or a
//! self-contained virtualenv-style directory. Environments are compared by
//! their normalized absolute path, so two spellings of the same directory
//! pool onto the same worker.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::utils::errors::{CillowError, Result};

/// Sentinel string denoting the ambient/global environment.
pub const SYSTEM_ENVIRONMENT: &str = "$system";

/// A runtime environment an interpreter worker can be bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Environment {
    /// The ambient interpreter found on PATH.
    System,
    /// A self-contained environment directory.
    Venv(PathBuf),
}

impl Environment {
    /// Parse an environment string, normalizing paths to absolute form.
    pub fn parse(value: &str) -> Result<Self> {
        if value == SYSTEM_ENVIRONMENT {
            return Ok(Environment::System);
        }
        if value.is_empty() {
            return Err(CillowError::InvalidEnvironment(value.to_string()));
        }
        let path = std::path::absolute(Path::new(value))
            .map_err(|_| CillowError::InvalidEnvironment(value.to_string()))?;
        Ok(Environment::Venv(path))
    }

    /// Check that the environment actually exists on this host.
    ///
    /// A venv must contain a `lib/site-packages` directory.
    pub fn validate(&self) -> Result<()> {
        match self {
            Environment::System => Ok(()),
            Environment::Venv(path) => {
                if path.join("lib").join("site-packages").is_dir() {
                    Ok(())
                } else {
                    Err(CillowError::InvalidEnvironment(
                        path.display().to_string(),
                    ))
                }
            }
        }
    }

    /// The environment's `site-packages` directory, if it has a private one.
    pub fn site_packages(&self) -> Option<PathBuf> {
        match self {
            Environment::System => None,
            Environment::Venv(path) => Some(path.join("lib").join("site-packages")),
        }
    }

    /// Directory holding the environment's executables, if private.
    pub fn bin_dir(&self) -> Option<PathBuf> {
        match self {
            Environment::System => None,
            #[cfg(not(target_os = "windows"))]
            Environment::Venv(path) => Some(path.join("bin")),
            #[cfg(target_os = "windows")]
            Environment::Venv(path) => Some(path.join("Scripts")),
        }
    }

    /// Resolve the interpreter executable for this environment.
    pub fn interpreter(&self) -> Result<PathBuf> {
        match self {
            Environment::System => which::which("python3")
                .or_else(|_| which::which("python"))
                .map_err(|e| CillowError::InterpreterNotFound(e.to_string())),
            Environment::Venv(path) => {
                #[cfg(not(target_os = "windows"))]
                let exe = path.join("bin").join("python");
                #[cfg(target_os = "windows")]
                let exe = path.join("Scripts").join("python.exe");
                if exe.is_file() {
                    Ok(exe)
                } else {
                    Err(CillowError::InterpreterNotFound(exe.display().to_string()))
                }
            }
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::System => f.write_str(SYSTEM_ENVIRONMENT),
            Environment::Venv(path) => write!(f, "{}", path.display()),
        }
    }
}

impl Serialize for Environment {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Environment {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Environment::parse(&value).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_system_sentinel() {
        assert_eq!(Environment::parse("$system").unwrap(), Environment::System);
    }

    #[test]
    fn test_parse_normalizes_to_absolute() {
        let env = Environment::parse("some/venv").unwrap();
        match env {
            Environment::Venv(path) => assert!(path.is_absolute()),
            Environment::System => panic!("expected venv"),
        }
    }

    #[test]
    fn test_equal_after_normalization() {
        let cwd = std::env::current_dir().unwrap();
        let relative = Environment::parse("some/venv").unwrap();
        let absolute =
            Environment::parse(cwd.join("some/venv").to_str().unwrap()).unwrap();
        assert_eq!(relative, absolute);
    }

    #[test]
    fn test_validate_missing_venv_fails() {
        let env = Environment::parse("/definitely/not/a/venv").unwrap();
        assert!(env.validate().is_err());
    }

    #[test]
    fn test_validate_venv_layout() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("lib/site-packages")).unwrap();
        let env = Environment::parse(dir.path().to_str().unwrap()).unwrap();
        assert!(env.validate().is_ok());
    }

    #[test]
    fn test_serde_round_trip() {
        let env = Environment::System;
        let json = serde_json::to_string(&env).unwrap();
        assert_eq!(json, "\"$system\"");
        let back: Environment = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Environment::System);
    }
}
