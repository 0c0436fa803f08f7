use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Record and replay API traffic of a user application.
#[derive(Parser, Debug)]
#[command(name = "keploy", version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Record the application's API calls and generate test cases with mocks.
    Record {
        #[command(flatten)]
        common: CommonArgs,

        /// Stop recording automatically after this many seconds.
        #[arg(long = "recordTimer", value_name = "SECONDS")]
        record_timer: Option<u64>,
    },

    /// Replay recorded test sets against the application and report verdicts.
    Test {
        #[command(flatten)]
        common: CommonArgs,

        #[command(flatten)]
        test: TestArgs,
    },

    /// Record or replay only the dependency mocks, without test cases.
    #[command(subcommand)]
    Mock(MockCommand),

    /// Load hooks and serve recorded mocks for an externally driven test run.
    Serve {
        #[command(flatten)]
        common: CommonArgs,

        #[command(flatten)]
        test: TestArgs,
    },

    /// Write a default keploy.yaml to the target path.
    GenerateConfig {
        /// Directory to place the generated keploy.yaml in.
        #[arg(short, long, default_value = ".")]
        path: PathBuf,
    },

    /// Print example invocations.
    Example,
}

#[derive(Subcommand, Debug)]
pub enum MockCommand {
    /// Capture outgoing calls as mocks only.
    Record {
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Serve previously captured mocks to the application.
    Test {
        #[command(flatten)]
        common: CommonArgs,
    },
}

/// Flags shared by every traffic-touching subcommand.
#[derive(Args, Debug, Default, Clone)]
pub struct CommonArgs {
    /// Command to start the user application.
    #[arg(short = 'c', long, env = "KEPLOY_COMMAND")]
    pub command: Option<String>,

    /// Directory in which recorded artifacts are kept.
    #[arg(short = 'p', long, env = "KEPLOY_TEST_PATH")]
    pub path: Option<PathBuf>,

    /// Port the transparent proxy listens on.
    #[arg(long = "proxyPort")]
    pub proxy_port: Option<u32>,

    /// Port the local DNS responder listens on.
    #[arg(long = "dnsPort")]
    pub dns_port: Option<u32>,

    /// Port the user application serves on.
    #[arg(long)]
    pub port: Option<u32>,

    /// Name of the application container.
    #[arg(long = "containerName")]
    pub container_name: Option<String>,

    /// Docker network of the application container.
    #[arg(long = "networkName")]
    pub network_name: Option<String>,

    /// Seconds to wait for a containerized application to build and boot.
    #[arg(short = 'b', long = "buildDelay", value_name = "SECONDS")]
    pub build_delay: Option<u64>,

    /// Destination ports whose traffic is relayed without interception.
    #[arg(long = "passThroughPorts", value_delimiter = ',')]
    pub pass_through_ports: Option<Vec<u16>>,

    /// Path to keploy.yaml.
    #[arg(long = "configPath", env = "KEPLOY_CONFIG_PATH")]
    pub config_path: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long)]
    pub debug: bool,

    /// Disable telemetry pings.
    #[arg(long = "disableTele")]
    pub disable_tele: bool,
}

/// Flags accepted by `test` and `serve`.
#[derive(Args, Debug, Default, Clone)]
pub struct TestArgs {
    /// Test sets to run (all on disk when omitted).
    #[arg(short = 't', long = "testsets", value_delimiter = ',')]
    pub test_sets: Option<Vec<String>>,

    /// Seconds to wait after app start before issuing test cases.
    #[arg(short = 'd', long, value_name = "SECONDS")]
    pub delay: Option<u64>,

    /// Per-test-case response deadline in seconds.
    #[arg(long = "apiTimeout", value_name = "SECONDS")]
    pub api_timeout: Option<u64>,

    /// Password for an authenticated MongoDB dependency.
    #[arg(long = "mongoPassword")]
    pub mongo_password: Option<String>,

    /// Capture coverage for the replayed run.
    #[arg(long)]
    pub coverage: bool,

    /// Directory to place coverage reports in.
    #[arg(long = "coverageReportPath")]
    pub coverage_report_path: Option<PathBuf>,

    /// Language of the user application (coverage tooling hint).
    #[arg(short = 'l', long)]
    pub language: Option<String>,

    /// Ignore array ordering when diffing JSON bodies.
    #[arg(long = "ignoreOrdering")]
    pub ignore_ordering: bool,

    /// Delete mocks that were never consumed by the run.
    #[arg(long = "removeUnusedMocks")]
    pub remove_unused_mocks: bool,
}
