//! Tracing setup with password scrubbing.
//!
//! All log output goes to stderr (stdout carries the worker heartbeat
//! protocol). The writer scrubs the configured database password out of
//! every line before emission, so no call site has to remember to.

use std::io::{self, Write};
use std::sync::Arc;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use validana_core::{AppConfig, LogFormat};

/// Initialise the global subscriber. Safe to call once per process.
pub fn init(config: &AppConfig) {
    let filter = tracing_subscriber::EnvFilter::try_new(&config.loglevel)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let writer = ScrubWriter::new(&config.dbpassword);

    match config.logformat {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(writer))
                .init();
        }
    }
}

/// Writer factory that strips the database password from every line.
#[derive(Clone)]
pub struct ScrubWriter {
    password: Option<Arc<str>>,
}

impl ScrubWriter {
    pub fn new(password: &str) -> Self {
        Self {
            password: (!password.is_empty()).then(|| Arc::from(password)),
        }
    }

    /// Apply the scrub to one chunk of output.
    fn scrub(&self, text: &str) -> String {
        match &self.password {
            Some(password) => text.replace(password.as_ref(), ""),
            None => text.to_string(),
        }
    }
}

impl<'a> MakeWriter<'a> for ScrubWriter {
    type Writer = ScrubSink;

    fn make_writer(&'a self) -> Self::Writer {
        ScrubSink {
            scrubber: self.clone(),
        }
    }
}

/// Sink applying the scrub, then writing to stderr.
pub struct ScrubSink {
    scrubber: ScrubWriter,
}

impl Write for ScrubSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let text = String::from_utf8_lossy(buf);
        let cleaned = self.scrubber.scrub(&text);
        io::stderr().write_all(cleaned.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_is_removed_everywhere() {
        let writer = ScrubWriter::new("s3cret");
        assert_eq!(
            writer.scrub("error: auth failed for s3cret at db:5432 (s3cret)"),
            "error: auth failed for  at db:5432 ()"
        );
    }

    #[test]
    fn empty_password_scrubs_nothing() {
        let writer = ScrubWriter::new("");
        assert_eq!(writer.scrub("unchanged"), "unchanged");
    }
}
