//! Sink writing: the destinations output bytes are delivered to, per
//! spec.md §3's `sink_set` and §4.7 step 5. Shared between the relay (client
//! stdout/stderr) and the ambient logging stack (daemon err/debug).

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::state::Sink;

/// A resolved destination ready to receive raw bytes: either an
/// append-only file handle or an open syslog connection.
pub enum SinkWriter {
    File(File),
    Syslog {
        logger: syslog::Logger<syslog::LoggerBackend, String>,
        priority: SyslogPriority,
    },
}

#[derive(Debug, Clone, Copy)]
pub enum SyslogPriority {
    Emerg,
    Alert,
    Crit,
    Err,
    Warning,
    Notice,
    Info,
    Debug,
}

pub fn parse_priority(s: &str) -> Option<SyslogPriority> {
    Some(match s {
        "emerg" => SyslogPriority::Emerg,
        "alert" => SyslogPriority::Alert,
        "crit" => SyslogPriority::Crit,
        "err" => SyslogPriority::Err,
        "warning" => SyslogPriority::Warning,
        "notice" => SyslogPriority::Notice,
        "info" => SyslogPriority::Info,
        "debug" => SyslogPriority::Debug,
        _ => return None,
    })
}

pub fn parse_facility(s: &str) -> Option<syslog::Facility> {
    use syslog::Facility::*;
    Some(match s {
        "kern" => LOG_KERN,
        "user" => LOG_USER,
        "mail" => LOG_MAIL,
        "daemon" => LOG_DAEMON,
        "auth" => LOG_AUTH,
        "syslog" => LOG_SYSLOG,
        "lpr" => LOG_LPR,
        "news" => LOG_NEWS,
        "uucp" => LOG_UUCP,
        "cron" => LOG_CRON,
        "local0" => LOG_LOCAL0,
        "local1" => LOG_LOCAL1,
        "local2" => LOG_LOCAL2,
        "local3" => LOG_LOCAL3,
        "local4" => LOG_LOCAL4,
        "local5" => LOG_LOCAL5,
        "local6" => LOG_LOCAL6,
        "local7" => LOG_LOCAL7,
        _ => return None,
    })
}

/// Parses a `facility.priority` spec; returns `None` if it doesn't look
/// like one (the caller then treats the string as a file path).
pub fn parse_syslog_spec(spec: &str) -> Option<(syslog::Facility, SyslogPriority)> {
    let (fac, pri) = spec.split_once('.')?;
    Some((parse_facility(fac)?, parse_priority(pri)?))
}

impl SinkWriter {
    pub fn open(sink: &Sink) -> io::Result<SinkWriter> {
        match sink {
            Sink::File(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Ok(SinkWriter::File(file))
            }
            Sink::Syslog { facility, priority } => {
                let facility = parse_facility(facility)
                    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "bad syslog facility"))?;
                let priority = parse_priority(priority)
                    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "bad syslog priority"))?;
                let formatter = syslog::Formatter3164 {
                    facility,
                    hostname: None,
                    process: "daemon".into(),
                    pid: std::process::id() as i32,
                };
                let logger = syslog::unix(formatter)
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
                Ok(SinkWriter::Syslog { logger, priority })
            }
        }
    }

    /// Delivers one chunk of output, per spec.md §4.7 step 5: file sinks
    /// get the raw bytes contiguously; syslog sinks split on `\n`, with a
    /// trailing partial line still emitted as its own record.
    pub fn write_chunk(&mut self, bytes: &[u8]) {
        match self {
            SinkWriter::File(f) => {
                let _ = f.write_all(bytes);
            }
            SinkWriter::Syslog { logger, priority } => {
                for line in bytes.split(|&b| b == b'\n') {
                    if line.is_empty() {
                        continue;
                    }
                    let text = String::from_utf8_lossy(line);
                    let _ = emit(logger, *priority, &text);
                }
            }
        }
    }
}

fn emit(
    logger: &mut syslog::Logger<syslog::LoggerBackend, String>,
    priority: SyslogPriority,
    text: &str,
) -> Result<(), syslog::Error> {
    match priority {
        SyslogPriority::Emerg => logger.emerg(text),
        SyslogPriority::Alert => logger.alert(text),
        SyslogPriority::Crit => logger.crit(text),
        SyslogPriority::Err => logger.err(text),
        SyslogPriority::Warning => logger.warning(text),
        SyslogPriority::Notice => logger.notice(text),
        SyslogPriority::Info => logger.info(text),
        SyslogPriority::Debug => logger.debug(text),
    }
}

/// Parses a `--errlog`/`--dbglog`/`--output`/`--stdout`/`--stderr` argument
/// into a `Sink`: a `facility.priority` pair if it parses as one, else a
/// plain file path.
pub fn parse_sink_spec(spec: &str) -> Sink {
    match parse_syslog_spec(spec) {
        Some(_) => {
            let (facility, priority) = spec.split_once('.').unwrap();
            Sink::Syslog {
                facility: facility.to_string(),
                priority: priority.to_string(),
            }
        }
        None => Sink::File(PathBuf::from(spec)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_syslog_spec() {
        assert!(matches!(parse_sink_spec("daemon.err"), Sink::Syslog { .. }));
    }

    #[test]
    fn falls_back_to_file_path() {
        assert!(matches!(parse_sink_spec("/tmp/out.log"), Sink::File(_)));
        assert!(matches!(parse_sink_spec("not.a.valid.spec"), Sink::File(_)));
    }

    #[test]
    fn path_without_dot_is_file() {
        assert!(matches!(parse_sink_spec("relative/log"), Sink::File(_)));
    }
}
