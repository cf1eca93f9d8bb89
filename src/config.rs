use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::TlsAcceptor;

/// Server settings, read once from `BARBERSLOT_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    /// Shared by every non-admin user.
    pub password: String,
    pub admin_user: String,
    /// Unset disables admin login.
    pub admin_password: Option<String>,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub store_timeout: Duration,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "barberslot".into(),
            admin_user: "admin".into(),
            admin_password: None,
            max_connections: 256,
            compact_threshold: 1000,
            store_timeout: crate::engine::DEFAULT_STORE_TIMEOUT,
            tls_cert: None,
            tls_key: None,
            metrics_port: None,
        }
    }
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> io::Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
            io::Error::new(ErrorKind::InvalidInput, format!("{key}: cannot parse {raw:?}"))
        }),
    }
}

impl Config {
    pub fn from_env() -> io::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> io::Result<Self> {
        let d = Self::default();
        Ok(Self {
            port: parsed(&lookup, "BARBERSLOT_PORT")?.unwrap_or(d.port),
            bind: lookup("BARBERSLOT_BIND").unwrap_or(d.bind),
            data_dir: lookup("BARBERSLOT_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            password: lookup("BARBERSLOT_PASSWORD").unwrap_or(d.password),
            admin_user: lookup("BARBERSLOT_ADMIN_USER").unwrap_or(d.admin_user),
            admin_password: lookup("BARBERSLOT_ADMIN_PASSWORD").filter(|p| !p.is_empty()),
            max_connections: parsed(&lookup, "BARBERSLOT_MAX_CONNECTIONS")?
                .unwrap_or(d.max_connections),
            compact_threshold: parsed(&lookup, "BARBERSLOT_COMPACT_THRESHOLD")?
                .unwrap_or(d.compact_threshold),
            store_timeout: parsed::<u64>(&lookup, "BARBERSLOT_STORE_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(d.store_timeout),
            tls_cert: lookup("BARBERSLOT_TLS_CERT"),
            tls_key: lookup("BARBERSLOT_TLS_KEY"),
            metrics_port: parsed(&lookup, "BARBERSLOT_METRICS_PORT")?,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn tls_acceptor(&self) -> io::Result<Option<TlsAcceptor>> {
        load_tls_acceptor(self.tls_cert.as_deref(), self.tls_key.as_deref())
    }
}

pub fn load_tls_acceptor(
    cert_path: Option<&str>,
    key_path: Option<&str>,
) -> io::Result<Option<TlsAcceptor>> {
    let (cert_path, key_path) = match (cert_path, key_path) {
        (None, None) => return Ok(None),
        (Some(c), Some(k)) => (c, k),
        _ => {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "set both BARBERSLOT_TLS_CERT and BARBERSLOT_TLS_KEY, or neither",
            ));
        }
    };

    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
        .collect::<Result<_, _>>()?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "no private key in key file"))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
    config.alpn_protocols = vec![b"postgresql".to_vec()];

    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}
