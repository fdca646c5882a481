//! FTP sessions for the feed server.

use std::time::Duration;

use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream};
use tracing::debug;

use crate::pool::{RemoteSession, SessionFactory};
use crate::{entry_name, RemoteError, TransientIoError};

const FILE_UNAVAILABLE: u32 = 550;
const NOT_LOGGED_IN: u32 = 530;

#[derive(Debug, Clone)]
pub struct FtpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub read_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct FtpConnector {
    config: FtpConfig,
}

impl FtpConnector {
    pub fn new(config: FtpConfig) -> Self {
        Self { config }
    }
}

pub struct FtpSession {
    stream: FtpStream,
}

fn classify(path: &str, err: FtpError) -> RemoteError {
    match err {
        FtpError::ConnectionError(io) => TransientIoError::new(path, io.to_string()).into(),
        FtpError::UnexpectedResponse(response) => {
            let code = response.status.code();
            let body = String::from_utf8_lossy(&response.body).trim().to_string();
            match code {
                FILE_UNAVAILABLE => RemoteError::NotFound(path.to_string()),
                NOT_LOGGED_IN => RemoteError::Auth(body),
                400..=499 => TransientIoError::new(path, format!("{code} {body}")).into(),
                _ => RemoteError::Protocol {
                    path: path.to_string(),
                    reason: format!("{code} {body}"),
                },
            }
        }
        other => RemoteError::Protocol {
            path: path.to_string(),
            reason: other.to_string(),
        },
    }
}

impl SessionFactory for FtpConnector {
    type Session = FtpSession;

    fn connect(&self) -> Result<FtpSession, RemoteError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let mut stream = FtpStream::connect(addr.as_str()).map_err(|e| classify(&addr, e))?;
        stream
            .get_ref()
            .set_read_timeout(Some(self.config.read_timeout))
            .map_err(|e| TransientIoError::new(&addr, e.to_string()))?;
        stream
            .login(self.config.user.as_str(), self.config.password.as_str())
            .map_err(|e| match classify(&addr, e) {
                RemoteError::Protocol { reason, .. } => RemoteError::Auth(reason),
                other => other,
            })?;
        stream
            .transfer_type(FileType::Binary)
            .map_err(|e| classify(&addr, e))?;
        debug!(host = %self.config.host, "ftp session established");
        Ok(FtpSession { stream })
    }
}

impl RemoteSession for FtpSession {
    fn list(&mut self, path: &str) -> Result<Vec<String>, RemoteError> {
        let target = if path.is_empty() { None } else { Some(path) };
        let entries = self.stream.nlst(target).map_err(|e| classify(path, e))?;
        Ok(entries.iter().filter_map(|e| entry_name(e)).collect())
    }

    fn fetch(&mut self, path: &str) -> Result<Vec<u8>, RemoteError> {
        let cursor = self
            .stream
            .retr_as_buffer(path)
            .map_err(|e| classify(path, e))?;
        Ok(cursor.into_inner())
    }
}

impl Drop for FtpSession {
    fn drop(&mut self) {
        let _ = self.stream.quit();
    }
}
