//! Process-wide configuration.
//!
//! Keys are read lowest-to-highest precedence from in-code defaults, a JSON
//! configuration file (master process only) and `VSERVER_`-prefixed
//! environment variables (all processes). The binary merges the sources with
//! figment and extracts into [`AppConfig`]; `validate()` is called once at
//! startup and reports every violation at once.

use serde::{Deserialize, Serialize};

/// Log output format.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable single-line output.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Complete application configuration.
///
/// Field names match the environment keys without the `VSERVER_` prefix
/// (figment lowercases on extraction), so `VSERVER_DBUSER` lands in `dbuser`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    /// Database user (required).
    pub dbuser: String,
    /// Database password (required). Scrubbed from every log line.
    pub dbpassword: String,
    /// Database name (required).
    pub dbname: String,
    /// Database host.
    #[serde(default = "default_dbhost")]
    pub dbhost: String,
    /// Database port.
    #[serde(default = "default_dbport")]
    pub dbport: u16,
    /// Minimum connections kept in the pool.
    #[serde(default)]
    pub dbminconnections: u32,
    /// Maximum connections in the pool.
    #[serde(default = "default_dbmaxconnections")]
    pub dbmaxconnections: u32,
    /// Port for the HTTP protocol.
    #[serde(default = "default_port")]
    pub httpport: u16,
    /// Port for the WebSocket protocol. May equal `httpport`, in which case
    /// both protocols share one listening server.
    #[serde(default = "default_port")]
    pub wsport: u16,
    /// Serve TLS instead of plain TCP.
    #[serde(default)]
    pub tls: bool,
    /// Path to the PEM private key (required when `tls`).
    #[serde(default)]
    pub keypath: String,
    /// Path to the PEM certificate chain (required when `tls`).
    /// The file is watched; changes hot-swap the secure context.
    #[serde(default)]
    pub certpath: String,
    /// Maximum request URL/body size in bytes. 0 = unlimited.
    #[serde(default = "default_maxpayloadsize")]
    pub maxpayloadsize: u64,
    /// WebSocket keep-alive interval in seconds (minimum 5).
    #[serde(default = "default_timeout")]
    pub timeout: u32,
    /// Worker memory limit in MB. 0 = unlimited, otherwise at least 50.
    #[serde(default)]
    pub maxmemory: u64,
    /// Seconds between metric syncs to the shared store. 0 disables metrics.
    #[serde(default)]
    pub metricsinterval: u32,
    /// Bearer token required by the `metrics` verb.
    #[serde(default)]
    pub metricstoken: String,
    /// Worker process count. Zero or positive is absolute; negative is added
    /// to the detected CPU count (so -1 means one worker per CPU but one).
    #[serde(default = "default_workers")]
    pub workers: i32,
    /// Log filter directive (tracing `EnvFilter` syntax).
    #[serde(default = "default_loglevel")]
    pub loglevel: String,
    /// Log output format.
    #[serde(default)]
    pub logformat: LogFormat,
    /// Enable the TTL caches. When false every cache read refreshes.
    #[serde(default = "default_caching")]
    pub caching: bool,
    /// Error-reporting endpoint. Accepted and validated for deployment
    /// parity; fatal errors are tagged with it.
    #[serde(default)]
    pub sentryurl: String,
    /// Create the `basics` schema and tables if absent. Normally the
    /// processor owns the schema; enable only for standalone deployments.
    #[serde(default)]
    pub dbschema: bool,
}

fn default_dbhost() -> String {
    "localhost".to_string()
}

fn default_dbport() -> u16 {
    5432
}

fn default_dbmaxconnections() -> u32 {
    10
}

fn default_port() -> u16 {
    8080
}

fn default_maxpayloadsize() -> u64 {
    1_000_000
}

fn default_timeout() -> u32 {
    60
}

fn default_workers() -> i32 {
    -1
}

fn default_loglevel() -> String {
    "info".to_string()
}

fn default_caching() -> bool {
    true
}

impl AppConfig {
    /// Validate configuration invariants. Returns every violation joined
    /// into a single message so operators fix them in one pass.
    pub fn validate(&self) -> Result<(), String> {
        let mut problems = Vec::new();

        if self.dbuser.is_empty() {
            problems.push("dbuser must not be empty".to_string());
        }
        if self.dbpassword.is_empty() {
            problems.push("dbpassword must not be empty".to_string());
        }
        if self.dbname.is_empty() {
            problems.push("dbname must not be empty".to_string());
        }
        if self.dbmaxconnections == 0 {
            problems.push("dbmaxconnections must be at least 1".to_string());
        }
        if self.dbminconnections > self.dbmaxconnections {
            problems.push(format!(
                "dbminconnections {} exceeds dbmaxconnections {}",
                self.dbminconnections, self.dbmaxconnections
            ));
        }
        if self.tls {
            if self.keypath.is_empty() {
                problems.push("keypath is required when tls is enabled".to_string());
            }
            if self.certpath.is_empty() {
                problems.push("certpath is required when tls is enabled".to_string());
            }
        }
        if self.timeout < 5 {
            problems.push(format!("timeout {} is below the minimum of 5", self.timeout));
        }
        if self.maxmemory != 0 && self.maxmemory < 50 {
            problems.push(format!(
                "maxmemory {} MB is below the minimum of 50 (use 0 for unlimited)",
                self.maxmemory
            ));
        }
        if self.metricsinterval > 86_400 {
            problems.push(format!(
                "metricsinterval {} exceeds one day",
                self.metricsinterval
            ));
        }
        if !self.sentryurl.is_empty()
            && !self.sentryurl.starts_with("http://")
            && !self.sentryurl.starts_with("https://")
        {
            problems.push(format!("sentryurl '{}' is not an http(s) url", self.sentryurl));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems.join("; "))
        }
    }

    /// Resolve the worker count against a detected CPU count.
    /// Negative values subtract from the CPU count; the result is never
    /// below one.
    pub fn worker_count(&self, cpus: usize) -> usize {
        if self.workers >= 0 {
            (self.workers as usize).max(1)
        } else {
            let reduced = cpus as i64 + self.workers as i64;
            reduced.max(1) as usize
        }
    }

    /// Whether HTTP and WebSocket share a single listening server.
    pub fn shared_port(&self) -> bool {
        self.httpport == self.wsport
    }

    /// Keep-alive interval as a Duration.
    pub fn keepalive(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout as u64)
    }

    /// Create a test configuration with in-range values.
    ///
    /// **For testing only.** Points at a database that is not expected to
    /// exist; tests using it must not connect.
    pub fn for_testing() -> Self {
        Self {
            dbuser: "validana".to_string(),
            dbpassword: "validana-test".to_string(),
            dbname: "validana".to_string(),
            dbhost: default_dbhost(),
            dbport: default_dbport(),
            dbminconnections: 0,
            dbmaxconnections: default_dbmaxconnections(),
            httpport: default_port(),
            wsport: default_port(),
            tls: false,
            keypath: String::new(),
            certpath: String::new(),
            maxpayloadsize: default_maxpayloadsize(),
            timeout: default_timeout(),
            maxmemory: 0,
            metricsinterval: 0,
            metricstoken: String::new(),
            workers: 1,
            loglevel: default_loglevel(),
            logformat: LogFormat::Text,
            caching: true,
            sentryurl: String::new(),
            dbschema: false,
        }
    }
}
