use std::{
    collections::BTreeMap,
    env,
    fs::File,
    io,
    path::{Path, PathBuf},
};

use chrono_tz::Tz;
use serde::Deserialize;
use tracing::debug;
use url::Url;

const DEFAULT_WORK_DIR: &str = "/tmp/card-export";
const DEFAULT_TIMEZONE: &str = "Asia/Tokyo";

/// An error encountered while loading or resolving a configuration profile.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Failed to load config file")]
    Io(#[from] io::Error),
    #[error("Invalid configuration")]
    Invalid(#[from] serde_yaml::Error),
    #[error("Profile '{0}' not found")]
    ProfileNotFound(String),
    #[error("No {0} configured")]
    MissingCredential(&'static str),
    #[error("Invalid API endpoint")]
    InvalidUri(#[from] url::ParseError),
    #[error("Unknown timezone '{0}'")]
    InvalidTimezone(String),
}

/// A fully resolved configuration profile for talking to the BI tool.
#[derive(Clone)]
pub struct Profile {
    /// The name of the profile.
    pub name: String,
    /// The login used to open a session.
    pub username: String,
    /// The password used to open a session.
    pub password: String,
    /// The API base. Always ends in `/`, so endpoint paths resolve beneath it.
    pub api_endpoint: Url,
    /// Where schema dumps, cached rows and output files are written.
    pub work_dir: PathBuf,
    /// Where session tokens are cached between runs.
    pub cache_dir: PathBuf,
    /// The zone used to interpret timestamps without an explicit offset.
    pub timezone: Tz,
    /// The user-agent used on requests. Intended for internal use.
    pub user_agent: String,
}

impl std::fmt::Debug for Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Profile")
            .field("name", &self.name)
            .field("username", &self.username)
            .field("password", &"********")
            .field("api_endpoint", &self.api_endpoint.as_str())
            .field("work_dir", &self.work_dir)
            .field("cache_dir", &self.cache_dir)
            .field("timezone", &self.timezone)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}

/// A profile stored in the config file.
#[derive(Debug, Default, Clone, Deserialize)]
struct ConfigProfile {
    username: Option<String>,
    password: Option<String>,
    api_endpoint: Option<String>,
    work_dir: Option<PathBuf>,
    cache_dir: Option<PathBuf>,
    timezone: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
struct Config {
    profiles: BTreeMap<String, ConfigProfile>,
}

impl Profile {
    /// Build a profile from explicit credentials, with every other setting at
    /// its default.
    pub fn new(username: &str, password: &str, api_endpoint: &str) -> Result<Self, Error> {
        Self::from_raw(
            ConfigProfile {
                username: Some(username.to_owned()),
                password: Some(password.to_owned()),
                api_endpoint: Some(api_endpoint.to_owned()),
                ..Default::default()
            },
            "default".to_owned(),
        )
    }

    /// Load the profile named by `CARD_EXPORT_PROFILE` (or `default`). See
    /// [Profile::from_env].
    pub fn from_default_env() -> Result<Self, Error> {
        if let Ok(s) = env::var("CARD_EXPORT_PROFILE") {
            Self::from_env(&s)
        } else {
            Self::from_env("default")
        }
    }

    /// Load the given profile from the configuration file (usually
    /// ~/.config/card-export.yaml). If no configuration file is present, then
    /// the configuration will be loaded solely from the environment.
    ///
    /// The following environment variables override the corresponding values
    /// in the config file:
    ///
    /// | Environment Variable          | Config Value   |
    /// |-------------------------------|----------------|
    /// | `CARD_EXPORT_USERNAME`        | `username`     |
    /// | `CARD_EXPORT_PASSWORD`        | `password`     |
    /// | `CARD_EXPORT_API_ENDPOINT`    | `api_endpoint` |
    /// | `CARD_EXPORT_WORK_DIR`        | `work_dir`     |
    /// | `CARD_EXPORT_CACHE_DIR`       | `cache_dir`    |
    /// | `CARD_EXPORT_TIMEZONE`        | `timezone`     |
    pub fn from_env(name: &str) -> Result<Self, Error> {
        let profile = match find_config().and_then(|path| read_profile(&path, name)) {
            Ok(p) => p,
            Err(Error::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                debug!("no config file found");
                Default::default()
            }
            Err(e) => return Err(e),
        };

        let var = |key: &str| env::var(key).ok();
        let merged = ConfigProfile {
            username: var("CARD_EXPORT_USERNAME").or(profile.username),
            password: var("CARD_EXPORT_PASSWORD").or(profile.password),
            api_endpoint: var("CARD_EXPORT_API_ENDPOINT").or(profile.api_endpoint),
            work_dir: var("CARD_EXPORT_WORK_DIR")
                .map(PathBuf::from)
                .or(profile.work_dir),
            cache_dir: var("CARD_EXPORT_CACHE_DIR")
                .map(PathBuf::from)
                .or(profile.cache_dir),
            timezone: var("CARD_EXPORT_TIMEZONE").or(profile.timezone),
        };

        Self::from_raw(merged, name.to_owned())
    }

    /// Load the given profile (or 'default') from the given file. Does not
    /// read any environment variables.
    pub fn read(path: impl AsRef<Path>, name: Option<&str>) -> Result<Self, Error> {
        let name = name.unwrap_or("default").to_owned();
        let profile = read_profile(path.as_ref(), &name)?;
        Self::from_raw(profile, name)
    }

    /// Use a different working directory. The session cache moves along with
    /// it unless it was configured separately.
    pub fn with_work_dir(self, work_dir: impl Into<PathBuf>) -> Self {
        let work_dir = work_dir.into();
        let cache_dir = if self.cache_dir == default_cache_dir(&self.work_dir) {
            default_cache_dir(&work_dir)
        } else {
            self.cache_dir
        };

        Self {
            work_dir,
            cache_dir,
            ..self
        }
    }

    /// Interpret zone-less timestamps in a different zone.
    pub fn with_timezone(self, timezone: Tz) -> Self {
        Self { timezone, ..self }
    }

    fn from_raw(raw: ConfigProfile, name: String) -> Result<Self, Error> {
        let ConfigProfile {
            username,
            password,
            api_endpoint,
            work_dir,
            cache_dir,
            timezone,
        } = raw;

        let username = username.ok_or(Error::MissingCredential("username"))?;
        let password = password.ok_or(Error::MissingCredential("password"))?;
        let api_endpoint = api_endpoint.ok_or(Error::MissingCredential("API endpoint"))?;
        let api_endpoint = parse_endpoint(&api_endpoint)?;

        let work_dir = work_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_WORK_DIR));
        let cache_dir = cache_dir.unwrap_or_else(|| default_cache_dir(&work_dir));

        let timezone = timezone.as_deref().unwrap_or(DEFAULT_TIMEZONE);
        let timezone = timezone
            .parse::<Tz>()
            .map_err(|_| Error::InvalidTimezone(timezone.to_owned()))?;

        Ok(Self {
            name,
            username,
            password,
            api_endpoint,
            work_dir,
            cache_dir,
            timezone,
            user_agent: make_ua(),
        })
    }
}

fn parse_endpoint(raw: &str) -> Result<Url, Error> {
    let mut raw = raw.trim().to_owned();
    if !raw.ends_with('/') {
        raw.push('/');
    }

    Ok(raw.parse()?)
}

fn default_cache_dir(work_dir: &Path) -> PathBuf {
    work_dir.join("session-cache")
}

fn find_config() -> Result<PathBuf, Error> {
    let Some(home) = env::home_dir() else {
        return Err(Error::Io(io::Error::other(
            "No $HOME found for the current user",
        )));
    };

    let canonical = home.join(".config/card-export.yaml");
    if canonical.exists() {
        return Ok(canonical);
    }

    let fallback = home.join(".config/card-export.yml");
    if fallback.exists() {
        return Ok(fallback);
    }

    Ok(canonical)
}

fn read_profile(p: &Path, name: &str) -> Result<ConfigProfile, Error> {
    let file = File::open(p)?;
    let mut config: Config = serde_yaml::from_reader(file).map_err(Error::Invalid)?;
    let Some(config_profile) = config.profiles.remove(name) else {
        return Err(Error::ProfileNotFound(name.to_string()));
    };

    debug!(path = %p.display(), "loaded config file");

    Ok(config_profile)
}

fn make_ua() -> String {
    format!("card-export/{}", env!("CARD_EXPORT_VERSION"))
}
