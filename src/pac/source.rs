use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use crate::error::SourceError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const READ_TIMEOUT: Duration = Duration::from_secs(20);
const PAC_ACCEPT: &str = "application/x-ns-proxy-autoconfig, */*;q=0.8";

/// Loads PAC script text from a file path, `file:` URL, or `http(s)` URL
/// and caches it. HTTP content is refetched once the server's `Expires`
/// header passes; without one the first fetch is kept for the lifetime of
/// the source.
pub struct ScriptSource {
    locator: String,
    client: reqwest::blocking::Client,
    cached_content: Option<String>,
    expires_at: Option<SystemTime>,
}

impl ScriptSource {
    pub fn new(locator: &str) -> Result<Self, SourceError> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(READ_TIMEOUT)
            .build()?;
        Ok(Self {
            locator: locator.to_string(),
            client,
            cached_content: None,
            expires_at: None,
        })
    }

    /// The locator this source was created with.
    pub fn description(&self) -> &str {
        &self.locator
    }

    pub fn content(&mut self) -> Result<String, SourceError> {
        let expired = match self.expires_at {
            Some(at) => SystemTime::now() >= at,
            None => false,
        };
        if let Some(ref content) = self.cached_content {
            if !expired {
                return Ok(content.clone());
            }
        }

        match self.fetch() {
            Ok(content) => {
                self.cached_content = Some(content.clone());
                Ok(content)
            }
            Err(e) => {
                log::error!("loading PAC script from {} failed: {e}", self.locator);
                self.cached_content = None;
                self.expires_at = None;
                Err(e)
            }
        }
    }

    fn fetch(&mut self) -> Result<String, SourceError> {
        // A locator without a scheme separator is a plain file path.
        if self.locator.starts_with("file:") || !self.locator.contains(":/") {
            self.read_file()
        } else {
            self.download()
        }
    }

    fn read_file(&self) -> Result<String, SourceError> {
        let path = if self.locator.contains(":/") {
            file_url_to_path(&self.locator)?
        } else {
            PathBuf::from(&self.locator)
        };
        Ok(std::fs::read_to_string(path)?)
    }

    fn download(&mut self) -> Result<String, SourceError> {
        let response = self
            .client
            .get(&self.locator)
            .header(reqwest::header::ACCEPT, PAC_ACCEPT)
            .send()?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(SourceError::HttpStatus(status.as_u16()));
        }

        self.expires_at = response
            .headers()
            .get(reqwest::header::EXPIRES)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| chrono::DateTime::parse_from_rfc2822(v).ok())
            .map(SystemTime::from);

        // PAC's traditional default charset predates UTF-8 everywhere.
        Ok(response.text_with_charset("ISO-8859-1")?)
    }
}

fn file_url_to_path(locator: &str) -> Result<PathBuf, SourceError> {
    let parsed = url::Url::parse(locator).map_err(|e| {
        SourceError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid PAC file URL {locator:?}: {e}"),
        ))
    })?;
    parsed.to_file_path().map_err(|_| {
        SourceError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("PAC file URL has no usable path: {locator:?}"),
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    fn temp_pac_file(contents: &str) -> PathBuf {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let path = std::env::temp_dir().join(format!(
            "pacbridge-test-{}-{}.pac",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::write(&path, contents).unwrap();
        path
    }

    /// One-shot HTTP server returning a fixed response, for exercising the
    /// blocking fetch path without a real webserver.
    fn serve_once(status_line: &'static str, headers: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 2048];
            let _ = stream.read(&mut buf).unwrap();
            let response = format!(
                "{status_line}\r\n{headers}Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).unwrap();
        });
        format!("http://{addr}/proxy.pac")
    }

    #[test]
    fn test_plain_file_path() {
        let path = temp_pac_file("function FindProxyForURL(u, h) { return 'DIRECT'; }");
        let mut source = ScriptSource::new(path.to_str().unwrap()).unwrap();
        assert!(source.content().unwrap().contains("DIRECT"));
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_file_content_is_cached() {
        let path = temp_pac_file("first");
        let mut source = ScriptSource::new(path.to_str().unwrap()).unwrap();
        assert_eq!(source.content().unwrap(), "first");

        std::fs::write(&path, "second").unwrap();
        assert_eq!(source.content().unwrap(), "first");
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_missing_file_clears_cache_and_errors() {
        let path = temp_pac_file("alive");
        let mut source = ScriptSource::new(path.to_str().unwrap()).unwrap();
        assert_eq!(source.content().unwrap(), "alive");

        // Force a refetch by marking the cache expired, then break the file.
        source.expires_at = Some(SystemTime::UNIX_EPOCH);
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(source.content(), Err(SourceError::Io(_))));
        assert!(source.cached_content.is_none());
    }

    #[test]
    fn test_http_fetch() {
        let url = serve_once(
            "HTTP/1.1 200 OK",
            "Content-Type: application/x-ns-proxy-autoconfig\r\n",
            "function FindProxyForURL(u, h) { return 'DIRECT'; }",
        );
        let mut source = ScriptSource::new(&url).unwrap();
        assert!(source.content().unwrap().contains("FindProxyForURL"));
        assert!(source.expires_at.is_none());
        // Second read must come from cache since the server is gone.
        assert!(source.content().is_ok());
    }

    #[test]
    fn test_http_expires_header() {
        let url = serve_once(
            "HTTP/1.1 200 OK",
            "Expires: Wed, 01 Jan 2070 00:00:00 GMT\r\n",
            "x",
        );
        let mut source = ScriptSource::new(&url).unwrap();
        source.content().unwrap();
        assert!(source.expires_at.unwrap() > SystemTime::now());
    }

    #[test]
    fn test_http_error_status() {
        let url = serve_once("HTTP/1.1 404 Not Found", "", "gone");
        let mut source = ScriptSource::new(&url).unwrap();
        assert!(matches!(source.content(), Err(SourceError::HttpStatus(404))));
    }

    #[test]
    fn test_description_is_the_locator() {
        let source = ScriptSource::new("http://wpad.example.com/proxy.pac").unwrap();
        assert_eq!(source.description(), "http://wpad.example.com/proxy.pac");
    }
}
