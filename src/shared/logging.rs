use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Once;

use chrono::Utc;
use serde_json::{json, Value};

use crate::shared::config::{self, LogFormat, LogMode, LoggingConfig};

static INIT: Once = Once::new();

/// Installs the global `env_logger` backend once, formatted per `LOG_FORMAT` and routed per
/// `LOG_MODE`. Later calls are no-ops, so tests may call it freely.
pub fn init() {
    INIT.call_once(|| {
        let cfg = config::logging_config().clone();
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));

        let format = cfg.format.clone();
        builder.format(move |buf, record| {
            let ts = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
            let msg = record.args().to_string();
            match format {
                LogFormat::Json => writeln!(
                    buf,
                    "{}",
                    json_line(&ts, record.level().as_str(), record.target(), &msg)
                ),
                LogFormat::Text => writeln!(
                    buf,
                    "{} {} {} {}",
                    ts,
                    record.level(),
                    record.target(),
                    msg
                ),
            }
        });

        let warning = route(&mut builder, &cfg);
        let _ = builder.try_init();
        if let Some(warning) = warning {
            log::warn!("{}", warning);
        }
    });
}

/// Points the builder at the configured sink. Falls back to stdout, returning why.
fn route(builder: &mut env_logger::Builder, cfg: &LoggingConfig) -> Option<String> {
    let (LogMode::File, Some(dir)) = (&cfg.mode, cfg.dir.as_ref()) else {
        builder.target(env_logger::Target::Stdout);
        return None;
    };
    let mut warning = std::fs::create_dir_all(dir)
        .err()
        .map(|err| format!("[logging] failed to create log dir: {}", err));
    let path = Path::new(dir).join(&cfg.file_name);
    match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(file) => {
            builder.target(env_logger::Target::Pipe(Box::new(file)));
        }
        Err(err) => {
            warning = Some(format!(
                "[logging] failed to open log file ({}): {}",
                path.display(),
                err
            ));
            builder.target(env_logger::Target::Stdout);
        }
    }
    warning
}

/// `{"ts","level","target","msg"}`, plus `component` when the message starts with `[name]`.
fn json_line(ts: &str, level: &str, target: &str, msg: &str) -> Value {
    let mut line = json!({
        "ts": ts,
        "level": level,
        "target": target,
        "msg": msg,
    });
    if let Some(component) = component_of(msg) {
        line["component"] = Value::from(component);
    }
    line
}

fn component_of(msg: &str) -> Option<&str> {
    let rest = msg.strip_prefix('[')?;
    let (name, _) = rest.split_once(']')?;
    (!name.is_empty() && !name.contains(char::is_whitespace)).then_some(name)
}
