use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::error;

use keploy::core::Core;
use keploy::platform::yaml::{YamlMockDb, YamlReportDb, YamlTestDb};
use keploy::record::Recorder;
use keploy::replay::Replayer;
use keploy::runtime::cli::{Cli, Command, CommonArgs, MockCommand, TestArgs};
use keploy::runtime::conf::Config;
use keploy::runtime::init_tracing;
use keploy::telemetry;

const EXAMPLES: &str = r#"Record:
  sudo -E env PATH=$PATH keploy record -c "/path/to/user/app/binary"

Test:
  sudo -E env PATH=$PATH keploy test -c "/path/to/user/app/binary" --delay 2

Select test sets:
  keploy test -c "./app" -t "test-set-0,test-set-2" --apiTimeout 10

Generate a config file:
  keploy generate-config -p .
"#;

fn load_config(common: &CommonArgs, test: Option<&TestArgs>) -> Result<Config, keploy::KeployError> {
    let mut config = Config::load(common.config_path.as_deref())?;
    config.apply_common(common);
    if let Some(test) = test {
        config.apply_test(test);
    }
    Ok(config)
}

struct Stores {
    test_db: Arc<YamlTestDb>,
    mock_db: Arc<YamlMockDb>,
    report_db: Arc<YamlReportDb>,
}

fn stores_for(path: &Path) -> Stores {
    Stores {
        test_db: Arc::new(YamlTestDb::new(path)),
        mock_db: Arc::new(YamlMockDb::new(path)),
        report_db: Arc::new(YamlReportDb::new(path)),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Command::Record {
            common,
            record_timer,
        } => {
            init_tracing(common.debug);
            let mut config = match load_config(&common, None) {
                Ok(config) => config,
                Err(e) => return fail(e),
            };
            if let Some(seconds) = record_timer {
                config.record.record_timer = seconds;
            }
            let stores = stores_for(&config.path);
            let recorder = Recorder::new(
                Core::new(config.clone()),
                stores.test_db,
                stores.mock_db,
                telemetry::for_session(config.disable_tele),
                config.command.clone(),
                Duration::from_secs(config.record.record_timer),
            );
            match recorder.start().await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => fail(e),
            }
        }

        Command::Test { common, test } => {
            init_tracing(common.debug);
            let config = match load_config(&common, Some(&test)) {
                Ok(config) => config,
                Err(e) => return fail(e),
            };
            let stores = stores_for(&config.path);
            let replayer = Replayer::new(
                Core::new(config.clone()),
                stores.test_db,
                stores.mock_db,
                stores.report_db,
                telemetry::for_session(config.disable_tele),
                config,
            );
            match replayer.start().await {
                Ok(true) => ExitCode::SUCCESS,
                Ok(false) => ExitCode::FAILURE,
                Err(e) => fail(e),
            }
        }

        Command::Mock(MockCommand::Record { common }) => {
            init_tracing(common.debug);
            let config = match load_config(&common, None) {
                Ok(config) => config,
                Err(e) => return fail(e),
            };
            let stores = stores_for(&config.path);
            let recorder = Recorder::new(
                Core::new(config.clone()),
                stores.test_db,
                stores.mock_db,
                telemetry::for_session(config.disable_tele),
                config.command.clone(),
                Duration::ZERO,
            );
            match recorder.start_mock().await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => fail(e),
            }
        }

        Command::Mock(MockCommand::Test { common }) => {
            init_tracing(common.debug);
            let config = match load_config(&common, None) {
                Ok(config) => config,
                Err(e) => return fail(e),
            };
            let stores = stores_for(&config.path);
            let replayer = Replayer::new(
                Core::new(config.clone()),
                stores.test_db,
                stores.mock_db,
                stores.report_db,
                telemetry::for_session(config.disable_tele),
                config,
            );
            // mock-only recordings live outside any test set
            match replayer.serve("").await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => fail(e),
            }
        }

        Command::Serve { common, test } => {
            init_tracing(common.debug);
            let config = match load_config(&common, Some(&test)) {
                Ok(config) => config,
                Err(e) => return fail(e),
            };
            let mock_set = config
                .test
                .selected_tests
                .first()
                .cloned()
                .unwrap_or_else(|| "test-set-0".to_string());
            let stores = stores_for(&config.path);
            let replayer = Replayer::new(
                Core::new(config.clone()),
                stores.test_db,
                stores.mock_db,
                stores.report_db,
                telemetry::for_session(config.disable_tele),
                config,
            );
            match replayer.serve(&mock_set).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => fail(e),
            }
        }

        Command::GenerateConfig { path } => {
            init_tracing(false);
            match Config::write_default(&path) {
                Ok(written) => {
                    println!("config file generated at {}", written.display());
                    ExitCode::SUCCESS
                }
                Err(e) => fail(e.into()),
            }
        }

        Command::Example => {
            println!("{EXAMPLES}");
            ExitCode::SUCCESS
        }
    }
}

fn fail(e: keploy::KeployError) -> ExitCode {
    error!(error.message = %e, "session failed");
    ExitCode::FAILURE
}
