use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runtime::cli::{CommonArgs, TestArgs};

/// Noise parameters: a field path (`header.Date`, `body.token`) mapped to an
/// optional list of value patterns. A listed path is excluded from both mock
/// matching and response diffing.
pub type NoiseParams = BTreeMap<String, Vec<String>>;

mod defaults {
    pub fn proxy_port() -> u32 {
        16789
    }

    pub fn dns_port() -> u32 {
        26789
    }

    pub fn build_delay() -> u64 {
        30
    }

    pub fn delay() -> u64 {
        5
    }

    pub fn api_timeout() -> u64 {
        5
    }

    pub fn keep_alive_idle_limit() -> u64 {
        4
    }

    pub fn ebpf_object_path() -> std::path::PathBuf {
        std::path::PathBuf::from("keploy_ebpf.o")
    }
}

/// Top-level configuration, resolved as defaults < `keploy.yaml` <
/// `KEPLOY_*` environment < CLI flags.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Directory in which recorded artifacts are kept.
    pub path: PathBuf,
    /// Command to start the user application.
    pub command: String,
    /// Port the user application serves on.
    pub port: u32,
    /// Port the local DNS responder listens on.
    pub dns_port: u32,
    /// Port the transparent proxy listens on.
    pub proxy_port: u32,
    pub debug: bool,
    pub disable_tele: bool,
    pub container_name: String,
    pub network_name: String,
    /// Seconds to wait for a containerized application to build and boot.
    pub build_delay: u64,
    /// Idle seconds after which a keep-alive connection's final exchange is
    /// flushed and the tracker reset.
    pub keep_alive_idle_limit: u64,
    /// Opaque eBPF object file the hook loader feeds to the kernel.
    pub ebpf_object_path: PathBuf,
    pub test: TestConf,
    pub record: RecordConf,
    /// Hosts/ports/paths whose traffic is relayed without interception.
    pub bypass_rules: Vec<BypassRule>,
    pub global_noise: GlobalNoise,
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TestConf {
    /// Test sets to run; empty means every set on disk.
    pub selected_tests: Vec<String>,
    /// Seconds to wait after app start before issuing test cases.
    pub delay: u64,
    /// Per-test-case response deadline in seconds.
    pub api_timeout: u64,
    pub coverage: bool,
    pub coverage_report_path: PathBuf,
    pub ignore_ordering: bool,
    pub mongo_password: String,
    pub language: String,
    pub remove_unused_mocks: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecordConf {
    /// Stop recording automatically after this many seconds (0 disables).
    pub record_timer: u64,
    pub filters: Vec<BypassRule>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BypassRule {
    pub path: String,
    pub host: String,
    pub port: u16,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalNoise {
    pub global: NoiseParams,
    #[serde(rename = "test-sets")]
    pub test_sets: BTreeMap<String, NoiseParams>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: PathBuf::from("."),
            command: String::new(),
            port: 0,
            dns_port: defaults::dns_port(),
            proxy_port: defaults::proxy_port(),
            debug: false,
            disable_tele: false,
            container_name: String::new(),
            network_name: String::new(),
            build_delay: defaults::build_delay(),
            keep_alive_idle_limit: defaults::keep_alive_idle_limit(),
            ebpf_object_path: defaults::ebpf_object_path(),
            test: TestConf {
                delay: defaults::delay(),
                api_timeout: defaults::api_timeout(),
                ..Default::default()
            },
            record: RecordConf::default(),
            bypass_rules: Vec::new(),
            global_noise: GlobalNoise::default(),
            config_path: None,
        }
    }
}

impl Config {
    /// Assemble the configuration for a session.
    ///
    /// An explicit `--configPath` must exist; otherwise `keploy.yaml` in the
    /// working directory is merged when present, and skipped silently when
    /// not.
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfError> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));

        let file = match config_path {
            Some(explicit) => {
                if !explicit.exists() {
                    return Err(ConfError::MissingConfigFile(explicit.to_path_buf()));
                }
                Some(explicit.to_path_buf())
            }
            None => {
                let implicit = PathBuf::from("keploy.yaml");
                implicit.exists().then_some(implicit)
            }
        };

        if let Some(path) = &file {
            match path.extension().and_then(|s| s.to_str()) {
                Some("yaml") | Some("yml") => {
                    figment = figment.merge(Yaml::file(path));
                }
                other => {
                    return Err(ConfError::InvalidExtension(
                        other.unwrap_or("none").to_string(),
                    ));
                }
            }
        }

        figment = figment.merge(Env::prefixed("KEPLOY_").map(env_key_to_config_key));

        let mut config: Config = figment.extract()?;
        config.config_path = file;
        Ok(config)
    }

    /// Overlay the shared CLI flags; only flags the user actually passed
    /// override the resolved configuration.
    pub fn apply_common(&mut self, args: &CommonArgs) {
        if let Some(command) = &args.command {
            self.command = command.clone();
        }
        if let Some(path) = &args.path {
            self.path = path.clone();
        }
        if let Some(port) = args.proxy_port {
            self.proxy_port = port;
        }
        if let Some(port) = args.dns_port {
            self.dns_port = port;
        }
        if let Some(port) = args.port {
            self.port = port;
        }
        if let Some(name) = &args.container_name {
            self.container_name = name.clone();
        }
        if let Some(name) = &args.network_name {
            self.network_name = name.clone();
        }
        if let Some(delay) = args.build_delay {
            self.build_delay = delay;
        }
        if let Some(ports) = &args.pass_through_ports {
            for port in ports {
                self.bypass_rules.push(BypassRule {
                    port: *port,
                    ..Default::default()
                });
            }
        }
        if args.debug {
            self.debug = true;
        }
        if args.disable_tele {
            self.disable_tele = true;
        }
    }

    /// Overlay the `test`/`serve` CLI flags.
    pub fn apply_test(&mut self, args: &TestArgs) {
        if let Some(sets) = &args.test_sets {
            self.test.selected_tests = sets.clone();
        }
        if let Some(delay) = args.delay {
            self.test.delay = delay;
        }
        if let Some(timeout) = args.api_timeout {
            self.test.api_timeout = timeout;
        }
        if let Some(password) = &args.mongo_password {
            self.test.mongo_password = password.clone();
        }
        if args.coverage {
            self.test.coverage = true;
        }
        if let Some(path) = &args.coverage_report_path {
            self.test.coverage_report_path = path.clone();
        }
        if let Some(language) = &args.language {
            self.test.language = language.clone();
        }
        if args.ignore_ordering {
            self.test.ignore_ordering = true;
        }
        if args.remove_unused_mocks {
            self.test.remove_unused_mocks = true;
        }
    }

    /// Destination ports exempt from interception.
    pub fn bypass_ports(&self) -> Vec<u16> {
        self.bypass_rules
            .iter()
            .filter(|r| r.port != 0)
            .map(|r| r.port)
            .collect()
    }

    /// Hostnames exempt from interception and mock matching.
    pub fn bypass_hosts(&self) -> Vec<String> {
        self.bypass_rules
            .iter()
            .filter(|r| !r.host.is_empty())
            .map(|r| r.host.clone())
            .collect()
    }

    /// Whether traffic to `host` should bypass mocking entirely.
    pub fn is_bypassed_host(&self, host: &str) -> bool {
        let bare = host.split(':').next().unwrap_or(host);
        self.bypass_rules
            .iter()
            .any(|r| !r.host.is_empty() && (r.host == host || r.host == bare))
    }

    /// Noise paths for a test set: global noise plus the set's own entries.
    pub fn noise_for(&self, test_set: &str) -> NoiseParams {
        let mut noise = self.global_noise.global.clone();
        if let Some(extra) = self.global_noise.test_sets.get(test_set) {
            noise.extend(extra.clone());
        }
        noise
    }

    pub fn keep_alive_idle_limit(&self) -> Duration {
        Duration::from_secs(self.keep_alive_idle_limit)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.test.api_timeout)
    }

    /// Write a commented default `keploy.yaml` into `dir`.
    pub fn write_default(dir: &Path) -> Result<PathBuf, ConfError> {
        let target = dir.join("keploy.yaml");
        let body = serde_yaml::to_string(&Config::default())?;
        fs::write(&target, body).map_err(|e| ConfError::Write(target.clone(), e))?;
        Ok(target)
    }
}

/// Map `KEPLOY_*` environment variable names onto camelCase config keys.
/// `KEPLOY_TEST_PATH` is the historical spelling for the artifact path.
fn env_key_to_config_key(key: &figment::value::UncasedStr) -> figment::value::Uncased<'_> {
    let raw = key.as_str().to_ascii_lowercase();
    if raw == "test_path" {
        return "path".into();
    }
    let mut out = String::with_capacity(raw.len());
    let mut upper_next = false;
    for ch in raw.chars() {
        if ch == '_' {
            upper_next = true;
        } else if upper_next {
            out.push(ch.to_ascii_uppercase());
            upper_next = false;
        } else {
            out.push(ch);
        }
    }
    figment::value::Uncased::from(out)
}

#[derive(Debug, Error)]
pub enum ConfError {
    #[error("config file {0} does not exist")]
    MissingConfigFile(PathBuf),

    #[error("unsupported config file extension: {0}")]
    InvalidExtension(String),

    #[error("configuration extraction failed: {0}")]
    Extraction(#[from] figment::Error),

    #[error("failed to serialize default configuration: {0}")]
    Serialize(#[from] serde_yaml::Error),

    #[error("failed to write {0}: {1}")]
    Write(PathBuf, #[source] std::io::Error),
}
