use std::path::{Path, PathBuf};

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;

use crate::db::DB_FILE;
use crate::store::{CATEGORY_INDEX_FILE, DOCUMENTS_FILE};

pub const DEFAULT_CONFIG_FILE: &str = "wikidump.toml";
pub const ENV_PREFIX: &str = "WIKIDUMP";

/// Which stores a run writes. The category index is always written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Documents,
    Relational,
    #[default]
    Both,
}

impl OutputFormat {
    pub fn documents(self) -> bool {
        matches!(self, OutputFormat::Documents | OutputFormat::Both)
    }

    pub fn relational(self) -> bool {
        matches!(self, OutputFormat::Relational | OutputFormat::Both)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub output_dir: PathBuf,
    pub format: OutputFormat,
    /// Category allow-list; empty admits everything.
    pub categories: Vec<String>,
    pub max_articles: Option<usize>,
    /// Raw records assembled per rayon batch.
    pub batch_size: usize,
    /// Articles buffered between parser and writers.
    pub channel_capacity: usize,
    pub commit_every: usize,
    pub progress_every: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            format: OutputFormat::Both,
            categories: Vec::new(),
            max_articles: None,
            batch_size: 32,
            channel_capacity: 64,
            commit_every: 500,
            progress_every: 100,
        }
    }
}

impl Settings {
    /// Defaults, then the TOML file, then `WIKIDUMP_*` variables. An explicit
    /// file must exist; the default `wikidump.toml` is optional.
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(config_file, environment())
    }

    fn load_with(config_file: Option<&Path>, env: Environment) -> Result<Self, ConfigError> {
        let file = match config_file {
            Some(path) => File::from(path).format(FileFormat::Toml).required(true),
            None => File::new(DEFAULT_CONFIG_FILE, FileFormat::Toml).required(false),
        };
        let settings: Settings = Config::builder()
            .add_source(file)
            .add_source(env)
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("batch_size", self.batch_size),
            ("channel_capacity", self.channel_capacity),
            ("commit_every", self.commit_every),
            ("progress_every", self.progress_every),
        ] {
            if value == 0 {
                return Err(ConfigError::Message(format!("{name} must be at least 1")));
            }
        }
        Ok(())
    }

    pub fn documents_path(&self) -> PathBuf {
        self.output_dir.join(DOCUMENTS_FILE)
    }

    pub fn database_path(&self) -> PathBuf {
        self.output_dir.join(DB_FILE)
    }

    pub fn category_index_path(&self) -> PathBuf {
        self.output_dir.join(CATEGORY_INDEX_FILE)
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("categories")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(vars: &[(&str, &str)]) -> Environment {
        let map: config::Map<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        environment().source(Some(map))
    }

    #[test]
    fn defaults_without_sources() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("none.toml");
        assert!(Settings::load_with(Some(missing.as_path()), env(&[])).is_err());

        let s = Settings::load_with(None, env(&[])).unwrap();
        assert_eq!(s.format, OutputFormat::Both);
        assert_eq!(s.batch_size, 32);
        assert_eq!(s.commit_every, 500);
        assert!(s.max_articles.is_none());
        assert!(s.categories.is_empty());
    }

    #[test]
    fn environment_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wikidump.toml");
        std::fs::write(
            &path,
            "format = \"documents\"\nmax_articles = 10\ncategories = [\"Cities\"]\n",
        )
        .unwrap();

        let from_file = Settings::load_with(Some(path.as_path()), env(&[])).unwrap();
        assert_eq!(from_file.format, OutputFormat::Documents);
        assert_eq!(from_file.max_articles, Some(10));
        assert_eq!(from_file.categories, vec!["Cities"]);

        let s = Settings::load_with(
            Some(path.as_path()),
            env(&[
                ("WIKIDUMP_MAX_ARTICLES", "3"),
                ("WIKIDUMP_CATEGORIES", "History,Rome"),
            ]),
        )
        .unwrap();
        assert_eq!(s.max_articles, Some(3));
        assert_eq!(s.categories, vec!["History", "Rome"]);
        assert_eq!(s.format, OutputFormat::Documents);
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let err = Settings::load_with(None, env(&[("WIKIDUMP_BATCH_SIZE", "0")])).unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn format_selects_stores() {
        assert!(OutputFormat::Both.documents() && OutputFormat::Both.relational());
        assert!(!OutputFormat::Documents.relational());
        assert!(!OutputFormat::Relational.documents());
    }
}
