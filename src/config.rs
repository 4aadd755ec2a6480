//! Locating the containers-storage root and building the driver.
//!
//! The root is taken from, in order:
//!
//! - the `root` driver parameter
//! - `$CONTAINERS_STORAGE_ROOT`
//! - `storage.conf`: the `storage_conf` parameter, `$CONTAINERS_STORAGE_CONF`,
//!   or the per-user (`$XDG_CONFIG_HOME/containers/storage.conf`) or system
//!   (`/etc/containers/storage.conf`) file, depending on whether we run as root
//! - the first usable default location (see [`OverlayStorage::default_search_paths`])
//!
//! A typical storage.conf file looks like:
//! ```toml
//! [storage]
//! driver = "overlay"
//! graphroot = "/var/lib/containers/storage"
//! runroot = "/run/containers/storage"
//! rootless_storage_path = "$HOME/.local/share/containers/storage"
//! ```

use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::Deserialize;

use crate::{
    driver::ContainerStorageDriver,
    error::{Error, Result, StoreContext},
    regulator::Regulator,
    storage::{ImageStore, OverlayStorage},
    store::ContainerStore,
};

pub const ROOT_ENV: &str = "CONTAINERS_STORAGE_ROOT";
pub const STORAGE_CONF_ENV: &str = "CONTAINERS_STORAGE_CONF";
const SYSTEM_STORAGE_CONF: &str = "/etc/containers/storage.conf";

/// Operations admitted to the driver at once.
pub const CONCURRENCY_LIMIT: usize = 1;

/// The driver the factory builds.
pub type Driver = Regulator<ContainerStorageDriver<ContainerStore>>;

/// A parsed storage.conf file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConf {
    #[serde(default)]
    pub storage: StorageConfig,
}

/// The `[storage]` table.  Everything else in the file is ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
    /// Storage driver name; only "overlay" can be served.
    #[serde(default)]
    pub driver: String,

    #[serde(default, alias = "root")]
    pub graphroot: Option<PathBuf>,

    #[serde(default, alias = "run_root")]
    pub runroot: Option<PathBuf>,

    /// Used instead of `graphroot` by unprivileged users of the system file.
    #[serde(default)]
    pub rootless_storage_path: Option<String>,
}

impl StorageConf {
    pub fn from_toml(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_toml(&content)
            .map_err(|e| Error::Config(format!("parsing {}: {e}", path.display())))
    }
}

/// Parameters accepted by the driver factory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverConfig {
    /// Storage root to serve.
    pub root: Option<PathBuf>,
    /// storage.conf file to read the root from.
    pub storage_conf: Option<PathBuf>,
}

impl DriverConfig {
    /// Rejects unknown keys.
    pub fn from_parameters(parameters: &HashMap<String, String>) -> Result<Self> {
        let mut config = DriverConfig::default();
        for (key, value) in parameters {
            match key.as_str() {
                "root" => config.root = Some(value.into()),
                "storage_conf" => config.storage_conf = Some(value.into()),
                _ => return Err(Error::Config(format!("unknown driver parameter {key:?}"))),
            }
        }
        Ok(config)
    }
}

/// What root resolution needs from the process environment.
trait Environment {
    fn var(&self, name: &str) -> Option<String>;
    fn is_root(&self) -> bool;
    fn uid(&self) -> u32;
}

struct Process;

impl Environment for Process {
    fn var(&self, name: &str) -> Option<String> {
        env::var(name).ok().filter(|v| !v.is_empty())
    }

    fn is_root(&self) -> bool {
        rustix::process::getuid().is_root()
    }

    fn uid(&self) -> u32 {
        rustix::process::getuid().as_raw()
    }
}

/// Expands `$HOME`, `$UID` and `$USER` the way containers-storage does.
fn expand(path: &str, env: &impl Environment) -> PathBuf {
    let mut expanded = path.replace("$UID", &env.uid().to_string());
    for var in ["HOME", "USER"] {
        if let Some(value) = env.var(var) {
            expanded = expanded.replace(&format!("${var}"), &value);
        }
    }
    PathBuf::from(expanded)
}

fn user_storage_conf(env: &impl Environment) -> Option<PathBuf> {
    match env.var("XDG_CONFIG_HOME") {
        Some(config) => Some(PathBuf::from(config)),
        None => env.var("HOME").map(|home| PathBuf::from(home).join(".config")),
    }
    .map(|dir| dir.join("containers/storage.conf"))
}

/// Root from a storage.conf file, if one applies.
fn root_from_conf(config: &DriverConfig, env: &impl Environment) -> Result<Option<PathBuf>> {
    // an explicitly named file must exist, the implicit ones may not
    let (path, user_owned) = match (&config.storage_conf, env.var(STORAGE_CONF_ENV)) {
        (Some(path), _) => (path.clone(), true),
        (None, Some(path)) => (PathBuf::from(path), true),
        (None, None) => {
            let user = user_storage_conf(env).filter(|p| !env.is_root() && p.exists());
            match user {
                Some(path) => (path, true),
                None if Path::new(SYSTEM_STORAGE_CONF).exists() => {
                    (PathBuf::from(SYSTEM_STORAGE_CONF), env.is_root())
                }
                None => return Ok(None),
            }
        }
    };

    log::debug!("reading storage configuration from {}", path.display());
    let conf = StorageConf::load(&path)?.storage;
    if !conf.driver.is_empty() && conf.driver != "overlay" {
        log::warn!(
            "{} configures the {} driver; only overlay storage can be served",
            path.display(),
            conf.driver
        );
    }
    let rootless = conf.rootless_storage_path.as_deref().map(|p| expand(p, env));
    Ok(match (env.is_root(), user_owned) {
        (true, _) => conf.graphroot,
        (false, true) => conf.graphroot.or(rootless),
        (false, false) => rootless,
    })
}

fn resolve_root_in(config: &DriverConfig, env: &impl Environment) -> Result<Option<PathBuf>> {
    if let Some(root) = &config.root {
        return Ok(Some(root.clone()));
    }
    if let Some(root) = env.var(ROOT_ENV) {
        return Ok(Some(root.into()));
    }
    root_from_conf(config, env)
}

/// The configured storage root, or `None` to search the default locations.
pub fn resolve_root(config: &DriverConfig) -> Result<Option<PathBuf>> {
    resolve_root_in(config, &Process)
}

/// Opens the configured overlay storage.
pub fn open_storage(config: &DriverConfig) -> Result<OverlayStorage> {
    match resolve_root(config)? {
        Some(root) => {
            log::debug!("opening storage at {}", root.display());
            OverlayStorage::open(&root)
                .store_context(|| format!("opening storage at {}", root.display()))
        }
        None => OverlayStorage::discover().map_err(|e| Error::Config(e.to_string())),
    }
}

/// Builds the driver: containers-storage served one operation at a time.
pub fn open_driver(config: &DriverConfig) -> Result<Driver> {
    let storage: Arc<dyn ImageStore> = Arc::new(open_storage(config)?);
    Ok(driver_for(storage))
}

/// The driver stack over any image store.
pub fn driver_for(storage: Arc<dyn ImageStore>) -> Driver {
    let store = ContainerStore::new(storage);
    Regulator::new(
        ContainerStorageDriver::new(Arc::new(store)),
        CONCURRENCY_LIMIT,
    )
}

/// [`open_driver`] from a factory parameter map.
pub fn create(parameters: &HashMap<String, String>) -> Result<Driver> {
    open_driver(&DriverConfig::from_parameters(parameters)?)
}
