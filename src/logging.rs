use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::sync::Once;

static INIT: Once = Once::new();
static INIT_RESULT: Mutex<Option<Result<(), String>>> = Mutex::new(None);

const PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S)} - {l} - {m}{n}";

/// Installs the global logger: stderr always, plus `log_file` when given.
/// Only the first call has any effect.
pub fn setup_logging(level: LevelFilter, log_file: Option<&str>) -> Result<(), String> {
    INIT.call_once(|| {
        let result = (|| -> Result<(), String> {
            let console = ConsoleAppender::builder()
                .target(Target::Stderr)
                .encoder(Box::new(PatternEncoder::new(PATTERN)))
                .build();

            let mut builder =
                Config::builder().appender(Appender::builder().build("console", Box::new(console)));
            let mut root = Root::builder().appender("console");

            if let Some(log_file) = log_file {
                if let Some(log_dir) = Path::new(log_file).parent() {
                    if !log_dir.as_os_str().is_empty() {
                        fs::create_dir_all(log_dir)
                            .map_err(|e| format!("Failed to create log directory: {}", e))?;
                    }
                }

                let logfile = FileAppender::builder()
                    .encoder(Box::new(PatternEncoder::new(PATTERN)))
                    .append(true)
                    .build(log_file)
                    .map_err(|e| format!("Failed to create log file {}: {}", log_file, e))?;

                builder = builder.appender(Appender::builder().build("file", Box::new(logfile)));
                root = root.appender("file");
            }

            let config = builder
                .build(root.build(level))
                .map_err(|e| format!("Failed to build log config: {}", e))?;

            log4rs::init_config(config).map_err(|e| format!("Logging initialization failed: {}", e))?;
            Ok(())
        })();

        if let Ok(mut slot) = INIT_RESULT.lock() {
            *slot = Some(result);
        }
    });

    match INIT_RESULT.lock() {
        Ok(guard) => match guard.as_ref() {
            Some(Ok(())) => Ok(()),
            Some(Err(msg)) => Err(msg.clone()),
            None => Err("Logging not initialized".to_string()),
        },
        Err(_) => Err("Logging state poisoned".to_string()),
    }
}
