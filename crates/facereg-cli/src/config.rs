use anyhow::{bail, Context, Result};
use facereg_core::DEFAULT_TOLERANCE;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Effective configuration: defaults, then an optional JSON file, then
/// `FACEREG_*` environment variables.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Config {
    /// SQLite index of `(name, blob)` rows.
    pub index_path: PathBuf,
    /// Directory holding one blob per stored embedding.
    pub encodings_dir: PathBuf,
    /// Directory containing the SCRFD and ArcFace ONNX files.
    pub model_dir: PathBuf,
    /// Maximum embedding distance for a match.
    pub tolerance: f32,
}

/// On-disk JSON layout. `sqlite` and `encodings_dir` keep their historical names.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    sqlite: Option<PathBuf>,
    encodings_dir: Option<PathBuf>,
    model_dir: Option<PathBuf>,
    tolerance: Option<f32>,
}

impl Config {
    /// Defaults rooted at `data_dir`.
    pub fn with_data_dir(data_dir: &Path) -> Self {
        Self {
            index_path: data_dir.join("faces.db"),
            encodings_dir: data_dir.join("encodings"),
            model_dir: data_dir.join("models"),
            tolerance: DEFAULT_TOLERANCE,
        }
    }

    /// Load configuration from the process environment and optional file.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        Self::load_with(file, |key| std::env::var(key).ok())
    }

    fn load_with(file: Option<&Path>, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let data_dir = env("FACEREG_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                env("XDG_DATA_HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| {
                        let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
                        PathBuf::from(home).join(".local/share")
                    })
                    .join("facereg")
            });

        let mut config = Self::with_data_dir(&data_dir);
        if let Some(path) = file {
            config.apply_file(path)?;
        }

        if let Some(v) = env("FACEREG_INDEX_PATH") {
            config.index_path = PathBuf::from(v);
        }
        if let Some(v) = env("FACEREG_ENCODINGS_DIR") {
            config.encodings_dir = PathBuf::from(v);
        }
        if let Some(v) = env("FACEREG_MODEL_DIR") {
            config.model_dir = PathBuf::from(v);
        }
        if let Some(v) = env("FACEREG_TOLERANCE") {
            config.tolerance = v
                .parse()
                .with_context(|| format!("FACEREG_TOLERANCE is not a number: {v:?}"))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Overlay values from a JSON file. Relative paths resolve against the
    /// file's own directory.
    fn apply_file(&mut self, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let file: FileConfig = serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let resolve = |p: PathBuf| if p.is_relative() { base.join(p) } else { p };

        if let Some(p) = file.sqlite {
            self.index_path = resolve(p);
        }
        if let Some(p) = file.encodings_dir {
            self.encodings_dir = resolve(p);
        }
        if let Some(p) = file.model_dir {
            self.model_dir = resolve(p);
        }
        if let Some(t) = file.tolerance {
            self.tolerance = t;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if !self.tolerance.is_finite() || self.tolerance < 0.0 {
            bail!("tolerance must be a non-negative number, got {}", self.tolerance);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_under_xdg_data_home() {
        let config = Config::load_with(None, env_of(&[("XDG_DATA_HOME", "/data")])).unwrap();
        assert_eq!(config.index_path, PathBuf::from("/data/facereg/faces.db"));
        assert_eq!(config.encodings_dir, PathBuf::from("/data/facereg/encodings"));
        assert_eq!(config.model_dir, PathBuf::from("/data/facereg/models"));
        assert_eq!(config.tolerance, DEFAULT_TOLERANCE);
    }

    #[test]
    fn test_defaults_fall_back_to_home() {
        let config = Config::load_with(None, env_of(&[("HOME", "/home/u")])).unwrap();
        assert_eq!(
            config.index_path,
            PathBuf::from("/home/u/.local/share/facereg/faces.db")
        );
    }

    #[test]
    fn test_file_values_resolve_relative_to_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("appconf.json");
        std::fs::write(
            &path,
            r#"{"sqlite": "people.db", "encodings_dir": "encodings", "tolerance": 0.5}"#,
        )
        .unwrap();

        let env = env_of(&[("FACEREG_DATA_DIR", "/srv")]);
        let config = Config::load_with(Some(path.as_path()), env).unwrap();
        assert_eq!(config.index_path, tmp.path().join("people.db"));
        assert_eq!(config.encodings_dir, tmp.path().join("encodings"));
        assert_eq!(config.model_dir, PathBuf::from("/srv/models"));
        assert_eq!(config.tolerance, 0.5);
    }

    #[test]
    fn test_env_overrides_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("appconf.json");
        std::fs::write(&path, r#"{"tolerance": 0.5, "model_dir": "/opt/models"}"#).unwrap();

        let config = Config::load_with(
            Some(path.as_path()),
            env_of(&[
                ("FACEREG_DATA_DIR", "/srv"),
                ("FACEREG_TOLERANCE", "0.45"),
                ("FACEREG_INDEX_PATH", "/var/lib/facereg/index.db"),
            ]),
        )
        .unwrap();
        assert_eq!(config.tolerance, 0.45);
        assert_eq!(config.index_path, PathBuf::from("/var/lib/facereg/index.db"));
        assert_eq!(config.model_dir, PathBuf::from("/opt/models"));
    }

    #[test]
    fn test_rejects_bad_tolerance() {
        let env = env_of(&[("FACEREG_DATA_DIR", "/srv"), ("FACEREG_TOLERANCE", "-1")]);
        assert!(Config::load_with(None, env).is_err());

        let env = env_of(&[("FACEREG_DATA_DIR", "/srv"), ("FACEREG_TOLERANCE", "close")]);
        assert!(Config::load_with(None, env).is_err());
    }

    #[test]
    fn test_rejects_unknown_file_keys() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("appconf.json");
        std::fs::write(&path, r#"{"sqlite": "a.db", "port": 8000}"#).unwrap();

        let env = env_of(&[("FACEREG_DATA_DIR", "/srv")]);
        assert!(Config::load_with(Some(path.as_path()), env).is_err());
    }
}
