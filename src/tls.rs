use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;

/// PEM certificate chain and private key for the listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl TlsFiles {
    /// Both paths or neither. One without the other is a configuration error.
    pub fn from_pair(cert: Option<String>, key: Option<String>) -> io::Result<Option<Self>> {
        match (cert, key) {
            (None, None) => Ok(None),
            (Some(cert), Some(key)) => Ok(Some(Self {
                cert: cert.into(),
                key: key.into(),
            })),
            _ => Err(io::Error::new(
                ErrorKind::InvalidInput,
                "FIELDBOOK_TLS_CERT and FIELDBOOK_TLS_KEY go together",
            )),
        }
    }

    /// Load both files. Errors name the file at fault.
    pub fn acceptor(&self) -> io::Result<TlsAcceptor> {
        let certs = rustls_pemfile::certs(&mut open(&self.cert)?).collect::<Result<Vec<_>, _>>()?;
        if certs.is_empty() {
            return Err(invalid(&self.cert, "no certificates"));
        }
        let key = rustls_pemfile::private_key(&mut open(&self.key)?)?
            .ok_or_else(|| invalid(&self.key, "no private key"))?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| invalid(&self.cert, &e.to_string()))?;
        config.alpn_protocols = vec![b"postgresql".to_vec()];
        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

fn open(path: &Path) -> io::Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| io::Error::new(e.kind(), format!("{}: {e}", path.display())))
}

fn invalid(path: &Path, what: &str) -> io::Error {
    io::Error::new(ErrorKind::InvalidInput, format!("{}: {what}", path.display()))
}
